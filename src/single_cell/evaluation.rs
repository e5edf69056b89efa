//! Comparison of selected genes against a reference set of differentially
//! expressed genes.

use rustc_hash::FxHashSet;
use serde::Serialize;

use crate::core::base::stats::hypergeom_pval;
use crate::core::data::de_table::DeReference;

/// Overlap of a gene selection with the reference
///
/// ### Fields
///
/// * `n_selected` - Number of selected genes within the universe.
/// * `n_reference` - Number of reference genes within the universe.
/// * `n_overlap` - Number of selected genes that are reference genes.
/// * `precision` - `n_overlap / n_selected` (0 for an empty selection).
/// * `recall` - `n_overlap / n_reference` (0 for an empty reference).
/// * `enrichment_p` - Hypergeometric probability of an overlap at least this
///   large.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SelectionEvaluation {
    pub n_selected: usize,
    pub n_reference: usize,
    pub n_overlap: usize,
    pub precision: f64,
    pub recall: f64,
    pub enrichment_p: f64,
}

/// Evaluate a gene selection against the reference
///
/// Genes outside the universe (the genes that were scored) are ignored on
/// both sides, duplicates count once.
///
/// ### Params
///
/// * `selected` - The selected genes.
/// * `reference` - The `DeReference`.
/// * `universe` - All genes that could have been selected.
///
/// ### Returns
///
/// The `SelectionEvaluation`.
pub fn evaluate_selection(
    selected: &[String],
    reference: &DeReference,
    universe: &[String],
) -> SelectionEvaluation {
    let universe: FxHashSet<&str> = universe.iter().map(|s| s.as_str()).collect();
    let selected: FxHashSet<&str> = selected
        .iter()
        .map(|s| s.as_str())
        .filter(|s| universe.contains(s))
        .collect();
    let n_reference = universe.iter().filter(|g| reference.contains(g)).count();
    let n_overlap = selected.iter().filter(|g| reference.contains(g)).count();
    let n_selected = selected.len();

    let precision = if n_selected > 0 {
        n_overlap as f64 / n_selected as f64
    } else {
        0.0
    };
    let recall = if n_reference > 0 {
        n_overlap as f64 / n_reference as f64
    } else {
        0.0
    };
    let enrichment_p = if n_overlap == 0 {
        1.0
    } else {
        hypergeom_pval(
            n_overlap - 1,
            n_reference,
            universe.len() - n_reference,
            n_selected,
        )
    };

    SelectionEvaluation {
        n_selected,
        n_reference,
        n_overlap,
        precision,
        recall,
        enrichment_p,
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_precision_recall() {
        let universe = names(&["a", "b", "c", "d", "e", "f", "g", "h"]);
        let reference = DeReference::from_genes(["a", "b", "c", "zz"]);
        let selected = names(&["a", "b", "d", "d", "yy"]);

        let ev = evaluate_selection(&selected, &reference, &universe);
        assert_eq!(ev.n_selected, 3);
        assert_eq!(ev.n_reference, 3);
        assert_eq!(ev.n_overlap, 2);
        assert!((ev.precision - 2.0 / 3.0).abs() < 1e-12);
        assert!((ev.recall - 2.0 / 3.0).abs() < 1e-12);
        // P(X >= 2) with 3 white, 5 black, 3 drawn = (15 + 1) / 56
        assert!((ev.enrichment_p - 16.0 / 56.0).abs() < 1e-10, "{}", ev.enrichment_p);
    }

    #[test]
    fn test_empty_selection() {
        let universe = names(&["a", "b"]);
        let reference = DeReference::from_genes(["a"]);
        let ev = evaluate_selection(&[], &reference, &universe);
        assert_eq!(ev.precision, 0.0);
        assert_eq!(ev.enrichment_p, 1.0);
    }
}
