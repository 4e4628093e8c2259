use std::collections::HashMap;

use crate::error::DbError;
use crate::traits::ResultSet;
use crate::value::Value;

/// The stored-result concrete kind: rows fully materialized into
/// client-owned memory, detached from the connection that produced them.
///
/// Iteration and accessors touch only this buffer, so a buffered set stays
/// valid after its connection closes and needs no synchronisation with
/// other traffic on that connection.
pub struct BufferedResultSet {
    columns: Vec<String>,
    by_name: HashMap<String, usize>,
    rows: Vec<Vec<Value>>,
    /// 0 = before first; 1..=rows.len() = current row; rows.len()+1 = after last.
    position: usize,
    closed: bool,
}

impl BufferedResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        let mut by_name = HashMap::with_capacity(columns.len());
        for (i, name) in columns.iter().enumerate() {
            // First occurrence wins for duplicate column names.
            by_name.entry(name.clone()).or_insert(i);
        }
        Self {
            columns,
            by_name,
            rows,
            position: 0,
            closed: false,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn current_row(&self) -> Result<&[Value], DbError> {
        if self.closed {
            return Err(DbError::result_exhausted("result set is closed"));
        }
        if self.position == 0 {
            return Err(DbError::result_exhausted("cursor is before the first row"));
        }
        if self.position > self.rows.len() {
            return Err(DbError::result_exhausted("cursor is after the last row"));
        }
        Ok(&self.rows[self.position - 1])
    }
}

impl ResultSet for BufferedResultSet {
    fn next(&mut self) -> Result<bool, DbError> {
        if self.closed {
            return Err(DbError::result_exhausted("result set is closed"));
        }
        if self.position <= self.rows.len() {
            self.position += 1;
        }
        Ok(self.position <= self.rows.len())
    }

    fn is_before_first(&self) -> bool {
        !self.closed && self.position == 0
    }

    fn is_after_last(&self) -> bool {
        !self.closed && !self.rows.is_empty() && self.position > self.rows.len()
    }

    fn row(&self) -> u64 {
        if self.closed || self.position == 0 || self.position > self.rows.len() {
            0
        } else {
            self.position as u64
        }
    }

    fn column_names(&self) -> Vec<String> {
        self.columns.clone()
    }

    fn column_count(&self) -> usize {
        self.columns.len()
    }

    fn column_index(&self, name: &str) -> Result<u32, DbError> {
        self.by_name
            .get(name)
            .map(|&i| (i + 1) as u32)
            .ok_or_else(|| DbError::column_not_found(name.to_string()))
    }

    fn get_value(&self, column: u32) -> Result<Value, DbError> {
        let row = self.current_row()?;
        if column == 0 || column as usize > row.len() {
            return Err(DbError::column_not_found(format!(
                "column index {column} out of range 1..={}",
                row.len()
            )));
        }
        Ok(row[column as usize - 1].clone())
    }

    fn close(&mut self) {
        self.closed = true;
        self.rows = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::BufferedResultSet;
    use crate::traits::ResultSet;
    use crate::value::Value;

    fn sample() -> BufferedResultSet {
        BufferedResultSet::new(
            vec!["id".to_string(), "name".to_string()],
            vec![
                vec![Value::Int(1), Value::Varchar("a".into())],
                vec![Value::Int(2), Value::Varchar("b".into())],
                vec![Value::Int(3), Value::Null],
            ],
        )
    }

    #[test]
    fn cursor_protocol() {
        let mut rs = sample();
        assert!(rs.is_before_first());
        assert!(!rs.is_after_last());
        assert_eq!(rs.row(), 0);

        let mut seen = Vec::new();
        while rs.next().unwrap() {
            seen.push(rs.get_int(1).unwrap());
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(rs.is_after_last());
        assert_eq!(rs.row(), 0);

        // Further advances stay at the end.
        assert!(!rs.next().unwrap());
        assert!(rs.is_after_last());
    }

    #[test]
    fn named_and_positional_accessors_agree() {
        let mut rs = sample();
        rs.next().unwrap();
        assert_eq!(rs.get_int(1).unwrap(), rs.get_int_named("id").unwrap());
        assert_eq!(rs.get_string(2).unwrap(), rs.get_string_named("name").unwrap());
        assert_eq!(rs.column_index("name").unwrap(), 2);
        assert!(matches!(
            rs.column_index("missing"),
            Err(crate::DbError::ColumnNotFound(_))
        ));
    }

    #[test]
    fn null_columns_yield_type_zero_and_is_null() {
        let mut rs = sample();
        rs.next().unwrap();
        rs.next().unwrap();
        rs.next().unwrap();
        assert!(rs.is_null(2).unwrap());
        assert_eq!(rs.get_string(2).unwrap(), "");
        assert_eq!(rs.get_int(2).unwrap(), 0);
    }

    #[test]
    fn accessor_outside_range_fails() {
        let mut rs = sample();
        assert_eq!(rs.get_int(1).unwrap_err().code(), "0x0301");
        while rs.next().unwrap() {}
        assert_eq!(rs.get_int(1).unwrap_err().code(), "0x0301");
    }

    #[test]
    fn close_is_idempotent_and_blocks_access() {
        let mut rs = sample();
        rs.next().unwrap();
        rs.close();
        rs.close();
        assert!(rs.next().is_err());
        assert!(rs.get_value(1).is_err());
        assert!(!rs.is_before_first());
        assert!(!rs.is_after_last());
    }

    #[test]
    fn empty_result_set_never_reports_after_last_before_iteration() {
        let mut rs = BufferedResultSet::empty();
        assert!(rs.is_before_first());
        assert!(!rs.next().unwrap());
    }
}
