//! Module containing anything and everything related to data and data
//! structures

pub mod de_table;
pub mod expression;
pub mod io;
pub mod sparse_io_mtx;
pub mod synthetic_data;
