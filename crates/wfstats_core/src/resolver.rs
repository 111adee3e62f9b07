use serde_json::Value;

use crate::entity::{
    Entity, FUNCTION_IMPLEMENTATIONS_KEY, FUNCTION_TESTERS_KEY, Function, Implementation, Tester,
    reference_id,
};
use crate::entity_map::EntityMap;

/// Ids listed under `key` of the function value, in source order.
///
/// A bare scalar becomes a one-element list. A list is a typed list, so its
/// first element (the item type) is dropped.
pub fn declared_ids<'a>(function: &'a Function, key: &str) -> Vec<&'a str> {
    let Some(field) = function.object().value_object().and_then(|value| value.get(key)) else {
        return Vec::new();
    };
    match field {
        Value::Array(items) => items.iter().skip(1).filter_map(reference_id).collect(),
        scalar => reference_id(scalar).into_iter().collect(),
    }
}

pub fn resolve_testers(function: &mut Function, testers: &EntityMap<Tester>) {
    let resolved = declared_ids(function, FUNCTION_TESTERS_KEY)
        .into_iter()
        .filter_map(|id| testers.get(id).cloned())
        .collect();
    function.testers = resolved;
}

pub fn resolve_implementations(function: &mut Function, implementations: &EntityMap<Implementation>) {
    let resolved = declared_ids(function, FUNCTION_IMPLEMENTATIONS_KEY)
        .into_iter()
        .filter_map(|id| implementations.get(id).map(|found| found.as_ref().clone()))
        .collect();
    function.implementations = resolved;
}
