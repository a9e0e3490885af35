//! Work-item context: the first user message of an investigation.
//!
//! Deterministic, zero-cost pre-processing of an edit record into a
//! markdown brief with a templated verification question and any
//! ontology warnings.

use crate::snapshot::EditRecord;
use serde::Serialize;
use serde_json::Value;

const HUMAN: &str = "Q5";
const INSTANCE_OF: &str = "P31";
const SUBCLASS_OF: &str = "P279";

/// Wikidata/Wikimedia bookkeeping classes that are almost never a correct
/// real-world P31/P279 value.
const INTERNAL_TYPE_VALUES: &[&str] = &[
    "Q18616576", // Wikidata property
    "Q19847637", // Wikidata property for an identifier
    "Q4167836",  // Wikimedia category
    "Q4167410",  // Wikimedia disambiguation page
    "Q11266439", // Wikimedia template
    "Q13406463", // Wikimedia list article
];

/// Diff type for an edit operation when the enrichment pipeline did not
/// supply a refined `edit_diff.type`.
fn diff_type_for_operation(operation: &str) -> &'static str {
    match operation {
        "wbsetclaim-create" | "wbcreateclaim-create" => "statement_added",
        "wbremoveclaims-remove" => "statement_removed",
        "wbsetclaim-update" | "wbsetclaimvalue" => "value_changed",
        "wbsetreference-add" => "reference_added",
        "wbsetreference-set" => "reference_changed",
        "wbremovereferences-remove" => "reference_removed",
        "wbsetqualifier-add" => "qualifier_added",
        "wbsetqualifier-update" => "qualifier_changed",
        "wbremovequalifiers-remove" => "qualifier_removed",
        _ => "unknown",
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.trim().is_empty())
}

/// Template a natural-language verification question for the edit.
///
/// Returns `None` when the edit has no `parsed_edit`.
pub fn verification_question(edit: &EditRecord) -> Option<String> {
    edit.get("parsed_edit")?;

    let operation = edit.str_at(&["parsed_edit", "operation"]).unwrap_or("");
    let prop = non_empty(edit.str_at(&["parsed_edit", "property_label"]))
        .or_else(|| edit.str_at(&["parsed_edit", "property"]))
        .unwrap_or("");
    let value = non_empty(edit.str_at(&["parsed_edit", "value_label"]))
        .or_else(|| edit.str_at(&["parsed_edit", "value_raw"]))
        .unwrap_or("");
    let item = non_empty(edit.str_at(&["item", "label_en"]))
        .or_else(|| edit.str_field("title"))
        .unwrap_or("unknown item");

    let diff_type = non_empty(edit.str_at(&["edit_diff", "type"]))
        .unwrap_or_else(|| diff_type_for_operation(operation));

    let question = match diff_type {
        "statement_removed" => {
            format!("Was \"{value}\" correctly removed as {prop} for {item}?")
        }
        "statement_added" => format!("Is \"{value}\" a correct {prop} for {item}?"),
        "value_changed" => format!("Is \"{value}\" a correct updated {prop} for {item}?"),
        "reference_added" => {
            format!("Does the added reference support the {prop} claim for {item}?")
        }
        "reference_changed" => {
            format!("Does the updated reference support the {prop} claim for {item}?")
        }
        "reference_removed" => {
            format!("Was the reference correctly removed from the {prop} claim for {item}?")
        }
        "qualifier_added" => {
            format!("Is \"{value}\" a correct qualifier for the {prop} claim on {item}?")
        }
        "qualifier_changed" => format!(
            "Is \"{value}\" a correct updated qualifier for the {prop} claim on {item}?"
        ),
        "qualifier_removed" => {
            format!("Was the qualifier correctly removed from the {prop} claim for {item}?")
        }
        "rank_changed" => format!("Is the rank change on the {prop} claim correct for {item}?"),
        _ => format!("Is the edit to {prop} (\"{value}\") correct for {item}?"),
    };
    Some(question)
}

/// Existing statement values for `property` on the edited item.
fn item_claim_values<'a>(edit: &'a EditRecord, property: &str) -> Vec<&'a str> {
    edit.get("item")
        .and_then(|item| item.get("claims"))
        .and_then(|claims| claims.get(property))
        .and_then(|claim| claim.get("statements"))
        .and_then(Value::as_array)
        .map(|statements| {
            statements
                .iter()
                .filter_map(|s| s.get("value").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default()
}

/// Flag ontologically suspicious P31/P279 edits.
pub fn ontology_warnings(edit: &EditRecord) -> Vec<String> {
    let mut warnings = Vec::new();
    let Some(property) = edit.str_at(&["parsed_edit", "property"]) else {
        return warnings;
    };
    if property != INSTANCE_OF && property != SUBCLASS_OF {
        return warnings;
    }

    let value = edit.str_at(&["parsed_edit", "value_raw"]).unwrap_or("");
    let value_label = non_empty(edit.str_at(&["parsed_edit", "value_label"])).unwrap_or(value);

    if INTERNAL_TYPE_VALUES.contains(&value) {
        warnings.push(format!(
            "WARNING: {value} ({value_label}) is a Wikidata/Wikimedia internal type, \
             not a real-world class. It is almost never a correct {property} value."
        ));
    }

    let instance_of = item_claim_values(edit, INSTANCE_OF);
    let subclass_of = item_claim_values(edit, SUBCLASS_OF);

    if property == SUBCLASS_OF && instance_of.contains(&HUMAN) {
        warnings.push(format!(
            "WARNING: {SUBCLASS_OF} (subclass of) is being added to an item that is an \
             instance of human ({HUMAN}). {SUBCLASS_OF} is for classes, not instances."
        ));
    }

    if property == INSTANCE_OF && value == HUMAN && !subclass_of.is_empty() {
        warnings.push(format!(
            "WARNING: {INSTANCE_OF} = human ({HUMAN}) is being added to an item that already \
             has {SUBCLASS_OF} (subclass of), which makes it a class. A class cannot be an \
             individual human."
        ));
    }

    warnings
}

#[derive(Serialize)]
struct EditMeta<'a> {
    rcid: Option<&'a Value>,
    revid: Option<&'a Value>,
    title: Option<&'a Value>,
    user: Option<&'a Value>,
    timestamp: Option<&'a Value>,
    tags: Vec<&'a Value>,
}

fn yaml_block<T: Serialize>(value: &T) -> String {
    serde_yaml::to_string(value).unwrap_or_else(|err| format!("(unserializable: {err})\n"))
}

/// Build the user message that opens the investigation for one edit.
pub fn build_edit_context(edit: &EditRecord) -> String {
    let mut parts = Vec::new();

    let meta = EditMeta {
        rcid: edit.get("rcid"),
        revid: edit.get("revid"),
        title: edit.get("title"),
        user: edit.get("user"),
        timestamp: edit.get("timestamp"),
        tags: edit
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| tags.iter().collect())
            .unwrap_or_default(),
    };
    parts.push("## Edit to verify\n".to_string());
    parts.push(yaml_block(&meta));

    for (key, heading) in [
        ("parsed_edit", "Parsed edit"),
        ("item", "Item context"),
        ("removed_claim", "Removed claim"),
    ] {
        if let Some(value) = edit.get(key) {
            parts.push(format!("\n## {heading}\n"));
            parts.push(yaml_block(value));
        }
    }

    parts.push("\n## Verification question\n".to_string());
    match verification_question(edit) {
        Some(question) => parts.push(question),
        None => parts.push(
            "(No verification question generated: parsed_edit is missing.)".to_string(),
        ),
    }

    let warnings = ontology_warnings(edit);
    if !warnings.is_empty() {
        parts.push(format!("\n\n{}", warnings.join("\n")));
    }

    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_edit(operation: &str, property_label: &str, value_label: &str) -> EditRecord {
        serde_json::from_value(json!({
            "rcid": 12345,
            "title": "Q12345",
            "parsed_edit": {
                "operation": operation,
                "property": "P106",
                "property_label": property_label,
                "value_raw": "Q999",
                "value_label": value_label,
            },
            "item": {"label_en": "Douglas Adams"},
        }))
        .unwrap()
    }

    fn make_ontological_edit(
        prop: &str,
        value_raw: &str,
        existing_p31: &[&str],
        existing_p279: &[&str],
    ) -> EditRecord {
        let statements = |values: &[&str]| {
            json!({"statements": values.iter().map(|v| json!({"value": v})).collect::<Vec<_>>()})
        };
        let mut claims = serde_json::Map::new();
        if !existing_p31.is_empty() {
            claims.insert("P31".to_string(), statements(existing_p31));
        }
        if !existing_p279.is_empty() {
            claims.insert("P279".to_string(), statements(existing_p279));
        }
        serde_json::from_value(json!({
            "rcid": 1,
            "title": "Q12345",
            "parsed_edit": {
                "operation": "wbsetclaim-create",
                "property": prop,
                "property_label": "instance of",
                "value_raw": value_raw,
                "value_label": value_raw,
            },
            "item": {"label_en": "Test Item", "claims": claims},
        }))
        .unwrap()
    }

    #[test]
    fn test_statement_added_question() {
        let edit = make_edit("wbsetclaim-create", "occupation", "singer-songwriter");
        assert_eq!(
            verification_question(&edit).unwrap(),
            "Is \"singer-songwriter\" a correct occupation for Douglas Adams?"
        );
    }

    #[test]
    fn test_statement_removed_question() {
        let edit = make_edit("wbremoveclaims-remove", "occupation", "novelist");
        assert_eq!(
            verification_question(&edit).unwrap(),
            "Was \"novelist\" correctly removed as occupation for Douglas Adams?"
        );
    }

    #[test]
    fn test_refined_diff_type_wins_over_operation() {
        let mut fields = make_edit("wbsetclaim-update", "employer", "Acme").fields().clone();
        fields.insert("edit_diff".to_string(), json!({"type": "reference_added"}));
        let edit = EditRecord::new(fields);
        assert_eq!(
            verification_question(&edit).unwrap(),
            "Does the added reference support the employer claim for Douglas Adams?"
        );
    }

    #[test]
    fn test_unknown_operation_fallback() {
        let edit = make_edit("wbeditentity", "occupation", "writer");
        assert_eq!(
            verification_question(&edit).unwrap(),
            "Is the edit to occupation (\"writer\") correct for Douglas Adams?"
        );
    }

    #[test]
    fn test_label_fallbacks() {
        let edit: EditRecord = serde_json::from_value(json!({
            "rcid": 1,
            "title": "Q77",
            "parsed_edit": {
                "operation": "wbsetclaim-create",
                "property": "P108",
                "value_raw": "Q124375837",
            },
        }))
        .unwrap();
        assert_eq!(
            verification_question(&edit).unwrap(),
            "Is \"Q124375837\" a correct P108 for Q77?"
        );
    }

    #[test]
    fn test_no_parsed_edit_returns_none() {
        let edit: EditRecord = serde_json::from_value(json!({"rcid": 1, "title": "Q1"})).unwrap();
        assert!(verification_question(&edit).is_none());
        assert!(build_edit_context(&edit).contains("No verification question generated"));
    }

    #[test]
    fn test_no_warnings_for_normal_p31() {
        let edit = make_ontological_edit("P31", "Q5", &[], &[]);
        assert!(ontology_warnings(&edit).is_empty());
    }

    #[test]
    fn test_no_warnings_for_non_ontological_property() {
        let edit = make_edit("wbsetclaim-create", "employer", "Acme Corp");
        assert!(ontology_warnings(&edit).is_empty());
    }

    #[test]
    fn test_warns_internal_type_value() {
        let edit = make_ontological_edit("P31", "Q19847637", &["Q5"], &[]);
        let warnings = ontology_warnings(&edit);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("internal type"));
    }

    #[test]
    fn test_warns_p279_on_person_instance() {
        let edit = make_ontological_edit("P279", "Q515", &["Q5"], &[]);
        let warnings = ontology_warnings(&edit);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("P279"));
        assert!(warnings[0].contains("classes, not instances"));
    }

    #[test]
    fn test_warns_p31_human_on_class_item() {
        let edit = make_ontological_edit("P31", "Q5", &[], &["Q7397"]);
        let warnings = ontology_warnings(&edit);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("class"));
    }

    #[test]
    fn test_multiple_warnings() {
        let edit = make_ontological_edit("P279", "Q19847637", &["Q5"], &[]);
        assert_eq!(ontology_warnings(&edit).len(), 2);
    }

    #[test]
    fn test_context_includes_sections_question_and_warnings() {
        let edit = make_ontological_edit("P31", "Q19847637", &["Q5"], &[]);
        let context = build_edit_context(&edit);
        assert!(context.starts_with("## Edit to verify"));
        assert!(context.contains("rcid: 1"));
        assert!(context.contains("## Parsed edit"));
        assert!(context.contains("## Item context"));
        assert!(!context.contains("## Removed claim"));
        assert!(context.contains("## Verification question"));
        assert!(context.contains("Is \"Q19847637\""));
        assert!(context.contains("WARNING"));
    }
}
