//! CSV loading for peer row blocks.

use std::path::Path;

use anyhow::Context;
use shroud_core::Matrix;

/// Load a headerless CSV file into a row block. When `label_col` is given,
/// that column is split off into the returned label vector instead of the
/// matrix.
pub fn load_csv_matrix(
    path: &Path,
    label_col: Option<usize>,
) -> anyhow::Result<(Matrix, Option<Vec<f64>>)> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;

    let mut rows = Vec::new();
    let mut labels = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let mut row = Vec::with_capacity(record.len());
        for (col, field) in record.iter().enumerate() {
            let value: f64 = field
                .parse()
                .with_context(|| format!("{}:{}: bad number `{field}`", line + 1, col + 1))?;
            if Some(col) == label_col {
                labels.push(value);
            } else {
                row.push(value);
            }
        }
        rows.push(row);
    }
    anyhow::ensure!(!rows.is_empty(), "{} contains no rows", path.display());

    Ok((Matrix::from_rows(&rows), label_col.map(|_| labels)))
}
