use std::cmp::Ordering;

use crate::{
    graph::{BranchItem, Condition, MatchMode, NodeId, Operator},
    state::{StateValue, Variables},
};

static NULL: StateValue = StateValue::Null;

fn lookup<'a>(variables: &'a Variables, name: &str) -> &'a StateValue {
    variables.get(name).unwrap_or(&NULL)
}

// Numbers order numerically and strings lexicographically; anything else is unordered.
fn order(left: &StateValue, right: &StateValue) -> Option<Ordering> {
    match (left, right) {
        (StateValue::Number(a), StateValue::Number(b)) => a.partial_cmp(b),
        (StateValue::String(a), StateValue::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Evaluates one condition against the session's variables. Unbound names read as null.
pub fn evaluate(condition: &Condition, variables: &Variables) -> bool {
    let left = lookup(variables, &condition.left);
    let right = lookup(variables, &condition.right);

    match condition.operator {
        Operator::Eq => left == right,
        Operator::Neq => left != right,
        Operator::Lt => order(left, right) == Some(Ordering::Less),
        Operator::Lte => matches!(order(left, right), Some(Ordering::Less | Ordering::Equal)),
        Operator::Gt => order(left, right) == Some(Ordering::Greater),
        Operator::Gte => matches!(order(left, right), Some(Ordering::Greater | Ordering::Equal)),
        Operator::Includes | Operator::StartsWith | Operator::EndsWith => {
            let (Some(haystack), Some(needle)) = (left.as_str(), right.as_text()) else {
                return false;
            };
            match condition.operator {
                Operator::Includes => haystack.contains(needle.as_str()),
                Operator::StartsWith => haystack.starts_with(needle.as_str()),
                _ => haystack.ends_with(needle.as_str()),
            }
        }
    }
}

/// `All` holds for an empty list, `Any` does not.
pub fn matches(item: &BranchItem, variables: &Variables) -> bool {
    match item.mode {
        MatchMode::All => item.conditions.iter().all(|c| evaluate(c, variables)),
        MatchMode::Any => item.conditions.iter().any(|c| evaluate(c, variables)),
    }
}

/// Picks the target of the first matching item, or the default edge.
pub fn select<'a>(
    items: &'a [BranchItem],
    default: Option<&'a NodeId>,
    variables: &Variables,
) -> Option<&'a NodeId> {
    items
        .iter()
        .find(|item| matches(item, variables))
        .map(|item| item.next.as_ref())
        .unwrap_or(default)
}
