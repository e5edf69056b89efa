pub mod de;
pub mod run;
pub mod simulate;

pub use de::{run_de, DeArgs};
pub use run::{run_run, RunArgs};
pub use simulate::{run_simulate, SimulateArgs};
