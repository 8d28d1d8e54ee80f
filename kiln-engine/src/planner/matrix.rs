// Matrix expansion
// Cartesian product over the declared axes, then exclude, then include.

use serde_json::Value;
use std::collections::HashMap;

use crate::expression::display_string;
use crate::workflow::models::Matrix;

/// One expanded matrix cell: the axis values a sibling job runs with.
pub type Cell = HashMap<String, Value>;

/// Expand a matrix into its cells.
///
/// Order is deterministic: axes are walked in sorted name order, values in
/// declaration order. `exclude` entries remove cells whose values all match;
/// `include` entries either augment matching cells or append new ones.
pub fn expand(matrix: &Matrix) -> Vec<Cell> {
    let mut axis_names: Vec<&String> = matrix.axes.keys().collect();
    axis_names.sort();

    let mut cells: Vec<Cell> = vec![HashMap::new()];
    for axis in &axis_names {
        let values = &matrix.axes[*axis];
        let mut next = Vec::with_capacity(cells.len() * values.len().max(1));
        for cell in &cells {
            for value in values {
                let mut expanded = cell.clone();
                expanded.insert((*axis).clone(), value.clone());
                next.push(expanded);
            }
        }
        cells = next;
    }

    // A matrix with no axes contributes no cartesian cells.
    if matrix.axes.is_empty() {
        cells.clear();
    }

    // Exclude first, against the raw product only.
    cells.retain(|cell| !matrix.exclude.iter().any(|ex| entry_matches(ex, cell)));

    // Include: merge extra keys into matching cells, append the rest.
    for inc in &matrix.include {
        let axis_part: HashMap<&String, &Value> = inc
            .iter()
            .filter(|(k, _)| matrix.axes.contains_key(*k))
            .collect();

        let mut merged_any = false;
        if !axis_part.is_empty() {
            for cell in &mut cells {
                let matches = axis_part
                    .iter()
                    .all(|(k, v)| cell.get(*k).is_some_and(|c| c == *v));
                if matches {
                    for (k, v) in inc {
                        cell.insert(k.clone(), v.clone());
                    }
                    merged_any = true;
                }
            }
        }

        if !merged_any {
            cells.push(inc.clone());
        }
    }

    cells
}

/// True when every key of the exclude entry matches the cell.
fn entry_matches(entry: &HashMap<String, Value>, cell: &Cell) -> bool {
    entry
        .iter()
        .all(|(k, v)| cell.get(k).is_some_and(|c| c == v))
}

/// Render a cell for job display names: `(linux, 1.75)`.
pub fn cell_label(cell: &Cell) -> String {
    let mut keys: Vec<&String> = cell.keys().collect();
    keys.sort();
    let parts: Vec<String> = keys
        .iter()
        .map(|k| display_string(&cell[*k]))
        .collect();
    parts.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn matrix(yaml: &str) -> Matrix {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_cartesian_product() {
        let m = matrix("os: [linux, macos]\nrust: ['1.75', '1.76']\n");
        let cells = expand(&m);
        assert_eq!(cells.len(), 4);
        assert!(cells
            .iter()
            .any(|c| c["os"] == json!("macos") && c["rust"] == json!("1.76")));
    }

    #[test]
    fn test_single_axis() {
        let m = matrix("n: [1, 2, 3]\n");
        let cells = expand(&m);
        assert_eq!(cells.len(), 3);
        assert_eq!(cells[0]["n"], json!(1));
        assert_eq!(cells[2]["n"], json!(3));
    }

    #[test]
    fn test_exclude_removes_matching_cells() {
        let m = matrix(
            "os: [linux, macos]\nrust: ['1.75', '1.76']\nexclude:\n  - os: macos\n    rust: '1.75'\n",
        );
        let cells = expand(&m);
        assert_eq!(cells.len(), 3);
        assert!(!cells
            .iter()
            .any(|c| c["os"] == json!("macos") && c["rust"] == json!("1.75")));
    }

    #[test]
    fn test_include_merges_extra_keys() {
        let m = matrix(
            "os: [linux, macos]\ninclude:\n  - os: linux\n    coverage: true\n",
        );
        let cells = expand(&m);
        assert_eq!(cells.len(), 2);
        let linux = cells.iter().find(|c| c["os"] == json!("linux")).unwrap();
        assert_eq!(linux["coverage"], json!(true));
        let macos = cells.iter().find(|c| c["os"] == json!("macos")).unwrap();
        assert!(!macos.contains_key("coverage"));
    }

    #[test]
    fn test_include_appends_novel_cells() {
        let m = matrix("os: [linux]\ninclude:\n  - os: windows\n    experimental: true\n");
        let cells = expand(&m);
        assert_eq!(cells.len(), 2);
        assert!(cells.iter().any(|c| c["os"] == json!("windows")));
    }

    #[test]
    fn test_include_only_matrix() {
        let m = matrix("include:\n  - os: linux\n  - os: macos\n");
        let cells = expand(&m);
        assert_eq!(cells.len(), 2);
    }

    #[test]
    fn test_cell_label() {
        let mut cell = Cell::new();
        cell.insert("os".into(), json!("linux"));
        cell.insert("rust".into(), json!("1.75"));
        assert_eq!(cell_label(&cell), "linux, 1.75");
    }
}
