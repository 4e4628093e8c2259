use crate::error::DbError;
use crate::value::{Value, ValueType};

/// One bound parameter slot: a type tag plus the payload.
///
/// NULL binds keep the caller's type hint in `ty` with `Value::Null` as the
/// payload, so drivers can still pick the right wire type.
#[derive(Debug, Clone)]
pub struct BoundParam {
    pub ty: ValueType,
    pub value: Value,
}

/// Fixed-length parameter bind table, sized at prepare time.
///
/// Indices are 1-based, matching the placeholder numbering of every backend.
/// Variable-size payloads (strings, byte buffers) are copied in at bind time
/// so the slot owns its storage until the wire send; streams are retained by
/// the `Blob` handle and drained at execution.
#[derive(Debug, Clone)]
pub struct BindTable {
    slots: Vec<Option<BoundParam>>,
}

impl BindTable {
    pub fn new(parameter_count: usize) -> Self {
        Self {
            slots: vec![None; parameter_count],
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot_index(&self, index: u32) -> Result<usize, DbError> {
        if index == 0 || index as usize > self.slots.len() {
            return Err(DbError::parameter(format!(
                "bind index {index} out of range 1..={}",
                self.slots.len()
            )));
        }
        Ok(index as usize - 1)
    }

    /// Store a typed copy in slot `index`, replacing any previous binding.
    pub fn set(&mut self, index: u32, ty: ValueType, value: Value) -> Result<(), DbError> {
        let i = self.slot_index(index)?;
        self.slots[i] = Some(BoundParam { ty, value });
        Ok(())
    }

    /// Clear slot `index` and mark it NULL with the given type hint.
    pub fn set_null(&mut self, index: u32, ty: ValueType) -> Result<(), DbError> {
        self.set(index, ty, Value::Null)
    }

    pub fn get(&self, index: u32) -> Result<Option<&BoundParam>, DbError> {
        let i = self.slot_index(index)?;
        Ok(self.slots[i].as_ref())
    }

    /// Reject execution with unbound slots before anything is sent.
    pub fn require_complete(&self) -> Result<(), DbError> {
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.is_none() {
                return Err(DbError::parameter(format!(
                    "parameter {} of {} is not bound",
                    i + 1,
                    self.slots.len()
                )));
            }
        }
        Ok(())
    }

    /// Snapshot of a fully bound table, for batch accumulation.
    pub fn snapshot(&self) -> Result<Vec<BoundParam>, DbError> {
        self.require_complete()?;
        Ok(self.slots.iter().flatten().cloned().collect())
    }

    /// Iterate slots in placeholder order.
    pub fn iter(&self) -> impl Iterator<Item = Option<&BoundParam>> {
        self.slots.iter().map(Option::as_ref)
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::BindTable;
    use crate::value::{Value, ValueType};

    #[test]
    fn indices_are_one_based() {
        let mut table = BindTable::new(2);
        assert!(table.set(0, ValueType::Integer, Value::Int(1)).is_err());
        assert!(table.set(3, ValueType::Integer, Value::Int(1)).is_err());
        table.set(1, ValueType::Integer, Value::Int(1)).unwrap();
        table.set(2, ValueType::Varchar, Value::Varchar("a".into())).unwrap();
        assert!(table.require_complete().is_ok());
    }

    #[test]
    fn missing_slot_is_rejected_before_send() {
        let mut table = BindTable::new(3);
        table.set(1, ValueType::Integer, Value::Int(1)).unwrap();
        table.set(3, ValueType::Integer, Value::Int(3)).unwrap();

        let err = table.require_complete().unwrap_err();
        assert_eq!(err.code(), "0x0202");
        assert!(err.to_string().contains("parameter 2"));
    }

    #[test]
    fn rebinding_replaces_value_and_type() {
        let mut table = BindTable::new(1);
        table.set(1, ValueType::Integer, Value::Int(1)).unwrap();
        table.set(1, ValueType::Varchar, Value::Varchar("x".into())).unwrap();

        let slot = table.get(1).unwrap().unwrap();
        assert_eq!(slot.ty, ValueType::Varchar);
        assert_eq!(slot.value, Value::Varchar("x".into()));
    }

    #[test]
    fn null_keeps_the_type_hint() {
        let mut table = BindTable::new(1);
        table.set_null(1, ValueType::Timestamp).unwrap();
        let slot = table.get(1).unwrap().unwrap();
        assert_eq!(slot.ty, ValueType::Timestamp);
        assert!(slot.value.is_null());
    }
}
