use rustc_hash::FxHashMap;
use spoolplan_common::Value;

#[derive(Debug, Clone, Default)]
pub struct TableStats {
    pub row_count: usize,
    pub column_stats: FxHashMap<String, ColumnStats>,
}

#[derive(Debug, Clone)]
pub struct ColumnStats {
    pub distinct_count: usize,
    pub null_count: usize,
    pub min_value: Option<Value>,
    pub max_value: Option<Value>,
}

impl TableStats {
    pub fn new(row_count: usize) -> Self {
        Self {
            row_count,
            column_stats: FxHashMap::default(),
        }
    }

    pub fn estimate_selectivity(&self, column: &str, op: &str) -> f64 {
        match self.column_stats.get(column) {
            Some(stats) if stats.distinct_count > 0 => match op {
                "=" => 1.0 / stats.distinct_count as f64,
                "<" | ">" | "<=" | ">=" => 0.33,
                "!=" | "<>" => 1.0 - (1.0 / stats.distinct_count as f64),
                _ => 0.5,
            },
            _ => 0.5,
        }
    }
}
