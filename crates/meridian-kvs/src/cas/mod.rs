//! Check-and-set request planning.
//!
//! A [`CheckAndSetRequest`] is declarative: columns, expectations, new
//! values. Backends execute it through a [`CasPlan`], which pins down
//! the operational meaning of each expectation:
//!
//! - an absent expectation becomes an insert-if-not-exists condition
//! - a value expectation becomes an update-if-equal condition
//! - multiple columns become one atomic batch over the shared row
//!
//! Planning also rejects malformed requests (no columns, duplicate
//! columns, oversized values) before any backend work happens, so every
//! backend enforces the same contract.

use bytes::Bytes;
use meridian_common::error::{MeridianError, MeridianResult};
use meridian_common::types::{Cell, Value};

use crate::api::{validate_write, CheckAndSetRequest};

/// Precondition attached to one planned write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasCondition {
    /// The cell must currently be absent.
    AbsenceExpected,
    /// The cell must currently hold exactly this value.
    ValueEqual(Value),
}

/// One cell's conditional write within a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CasOp {
    /// Target cell, combining the plan's row with one column.
    pub cell: Cell,
    /// Condition that must hold for the plan to apply.
    pub condition: CasCondition,
    /// Value stored when the whole plan applies.
    pub new_value: Value,
}

/// An executable check-and-set plan.
///
/// Every operation targets the same row; backends must apply the plan
/// as a unit or not at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CasPlan {
    row: Bytes,
    ops: Vec<CasOp>,
}

impl CasPlan {
    /// The row every operation targets.
    #[must_use]
    pub fn row(&self) -> &[u8] {
        &self.row
    }

    /// The planned operations, in request order.
    #[must_use]
    pub fn ops(&self) -> &[CasOp] {
        &self.ops
    }

    /// True when the plan updates more than one column and therefore
    /// requires batch atomicity from the backend.
    #[must_use]
    pub fn is_atomic_batch(&self) -> bool {
        self.ops.len() > 1
    }
}

/// Translates a request into an executable plan.
///
/// # Errors
///
/// `InvalidArgument` for an empty request or duplicate columns,
/// `CellNameTooLarge` or `ValueTooLarge` for oversized writes.
pub fn plan_check_and_set(request: &CheckAndSetRequest) -> MeridianResult<CasPlan> {
    if request.updates.is_empty() {
        return Err(MeridianError::invalid_argument(
            "check and set request contains no column updates",
        ));
    }

    let mut ops = Vec::with_capacity(request.updates.len());
    for update in &request.updates {
        let cell = Cell::new(request.row.clone(), update.column.clone());
        if ops.iter().any(|op: &CasOp| op.cell == cell) {
            return Err(MeridianError::invalid_argument(format!(
                "check and set request names column {:?} twice",
                update.column
            )));
        }
        validate_write(&cell, &update.new_value)?;

        let condition = match &update.expected {
            None => CasCondition::AbsenceExpected,
            Some(value) => CasCondition::ValueEqual(value.clone()),
        };
        ops.push(CasOp {
            cell,
            condition,
            new_value: update.new_value.clone(),
        });
    }

    Ok(CasPlan {
        row: request.row.clone(),
        ops,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ColumnUpdate;
    use meridian_common::types::TableRef;
    use meridian_common::MAX_VALUE_SIZE;

    fn table() -> TableRef {
        TableRef::create("test", "t").unwrap()
    }

    #[test]
    fn test_absent_expectation_plans_insert_if_not_exists() {
        let request = CheckAndSetRequest::single_column(
            table(),
            "row",
            "col",
            None,
            Value::from_bytes(b"v"),
        );
        let plan = plan_check_and_set(&request).unwrap();

        assert_eq!(plan.ops().len(), 1);
        assert!(!plan.is_atomic_batch());
        assert_eq!(plan.ops()[0].condition, CasCondition::AbsenceExpected);
        assert_eq!(plan.ops()[0].new_value, Value::from_bytes(b"v"));
    }

    #[test]
    fn test_value_expectation_plans_update_if_equal() {
        let request = CheckAndSetRequest::single_column(
            table(),
            "row",
            "col",
            Some(Value::from_bytes(b"old")),
            Value::from_bytes(b"new"),
        );
        let plan = plan_check_and_set(&request).unwrap();

        assert_eq!(
            plan.ops()[0].condition,
            CasCondition::ValueEqual(Value::from_bytes(b"old"))
        );
    }

    #[test]
    fn test_two_columns_plan_one_atomic_batch() {
        let request = CheckAndSetRequest {
            table: table(),
            row: Bytes::from_static(b"row"),
            updates: vec![
                ColumnUpdate {
                    column: Bytes::from_static(b"a"),
                    expected: None,
                    new_value: Value::from_bytes(b"1"),
                },
                ColumnUpdate {
                    column: Bytes::from_static(b"b"),
                    expected: Some(Value::from_bytes(b"x")),
                    new_value: Value::from_bytes(b"2"),
                },
            ],
        };
        let plan = plan_check_and_set(&request).unwrap();

        assert!(plan.is_atomic_batch());
        assert_eq!(plan.ops().len(), 2);
        assert!(plan.ops().iter().all(|op| op.cell.row() == b"row"));
        assert_eq!(plan.ops()[0].condition, CasCondition::AbsenceExpected);
        assert_eq!(
            plan.ops()[1].condition,
            CasCondition::ValueEqual(Value::from_bytes(b"x"))
        );
    }

    #[test]
    fn test_empty_request_rejected() {
        let request = CheckAndSetRequest {
            table: table(),
            row: Bytes::from_static(b"row"),
            updates: Vec::new(),
        };
        let err = plan_check_and_set(&request).unwrap_err();
        assert!(matches!(err, MeridianError::InvalidArgument { .. }));
    }

    #[test]
    fn test_duplicate_columns_rejected() {
        let request = CheckAndSetRequest {
            table: table(),
            row: Bytes::from_static(b"row"),
            updates: vec![
                ColumnUpdate {
                    column: Bytes::from_static(b"a"),
                    expected: None,
                    new_value: Value::from_bytes(b"1"),
                },
                ColumnUpdate {
                    column: Bytes::from_static(b"a"),
                    expected: None,
                    new_value: Value::from_bytes(b"2"),
                },
            ],
        };
        let err = plan_check_and_set(&request).unwrap_err();
        assert!(matches!(err, MeridianError::InvalidArgument { .. }));
    }

    #[test]
    fn test_oversized_value_rejected() {
        let request = CheckAndSetRequest::single_column(
            table(),
            "row",
            "col",
            None,
            Value::from_vec(vec![0u8; MAX_VALUE_SIZE + 1]),
        );
        let err = plan_check_and_set(&request).unwrap_err();
        assert!(matches!(err, MeridianError::ValueTooLarge { .. }));
    }
}
