/*
This file contains the validation rules enforced at admission:
the placement configuration labels of Deployments and
StatefulSets, and the immutability of the placement label
written on pods.
*/

use std::{
    collections::BTreeMap,
    fmt
};

use crate::utils::labels::{
    OPTIMIZE_SCHEDULING_CUSTOM_ON_DEMAND_KEY,
    OPTIMIZE_SCHEDULING_KEY,
    OPTIMIZE_SCHEDULING_STRATEGY_KEY,
    PLACEMENT_LABEL_KEY,
    STRATEGIES,
    STRATEGY_CUSTOM
};



#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldErrorKind {
    Invalid(String),
    Required,
}

/*
A rejected label, rendered the way the API server renders
field errors: `metadata.labels[<key>]: Invalid value: "<v>": <detail>`.
*/
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldError {
    pub key: String,
    pub kind: FieldErrorKind,
    pub detail: String,
}

impl FieldError {
    fn invalid(key: &str, value: &str, detail: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            kind: FieldErrorKind::Invalid(value.to_string()),
            detail: detail.into(),
        }
    }

    fn required(key: &str, detail: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            kind: FieldErrorKind::Required,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            FieldErrorKind::Invalid(value) => {
                write!(f, "metadata.labels[{}]: Invalid value: {:?}: {}", self.key, value, self.detail)
            }
            FieldErrorKind::Required => {
                write!(f, "metadata.labels[{}]: Required value: {}", self.key, self.detail)
            }
        }
    }
}

/*
This function joins field errors into one denial message.
A single error is printed as is, several are bracketed.
*/
pub fn aggregate(errors: &[FieldError]) -> String {
    match errors {
        [] => String::new(),
        [single] => single.to_string(),
        many => format!(
            "[{}]",
            many.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
        ),
    }
}

/*
This function checks the placement configuration labels of a
workload. Only labels that are present are checked, plus the
custom count that the custom strategy cannot do without.
*/
pub fn validate_optimize_scheduling_labels(labels: Option<&BTreeMap<String, String>>) -> Vec<FieldError> {
    let Some(labels) = labels else {
        return Vec::new();
    };
    let mut errors = Vec::new();

    if let Some(value) = labels.get(OPTIMIZE_SCHEDULING_KEY) {
        if value != "true" && value != "false" {
            errors.push(FieldError::invalid(OPTIMIZE_SCHEDULING_KEY, value, "value must be a boolean."));
        }
    }

    let strategy = labels.get(OPTIMIZE_SCHEDULING_STRATEGY_KEY);
    if let Some(value) = strategy {
        if !STRATEGIES.contains(&value.as_str()) {
            let mut allowed = STRATEGIES.to_vec();
            allowed.sort_unstable();
            errors.push(FieldError::invalid(
                OPTIMIZE_SCHEDULING_STRATEGY_KEY,
                value,
                format!("value must be in [{}].", allowed.join(" ")),
            ));
        }
    }

    let custom_count = labels.get(OPTIMIZE_SCHEDULING_CUSTOM_ON_DEMAND_KEY);
    if let Some(value) = custom_count {
        match value.parse::<i64>() {
            Err(_) => errors.push(FieldError::invalid(
                OPTIMIZE_SCHEDULING_CUSTOM_ON_DEMAND_KEY,
                value,
                "value must be a number.",
            )),
            Ok(count) if count < 0 => errors.push(FieldError::invalid(
                OPTIMIZE_SCHEDULING_CUSTOM_ON_DEMAND_KEY,
                value,
                "value must be greater than or equal to 0.",
            )),
            Ok(_) => {}
        }
    }

    if strategy.map(String::as_str) == Some(STRATEGY_CUSTOM) && custom_count.is_none() {
        errors.push(FieldError::required(
            OPTIMIZE_SCHEDULING_CUSTOM_ON_DEMAND_KEY,
            "value must not be empty when the strategy is custom.",
        ));
    }

    errors
}

/*
This function enforces that the placement label of a pod is
never changed by an update: unset stays unset, a set value
stays the same. Err carries the denial message.
*/
pub fn validate_placement_label_update(
    old_labels: Option<&BTreeMap<String, String>>,
    new_labels: Option<&BTreeMap<String, String>>,
) -> Result<(), String> {
    let old = old_labels.and_then(|labels| labels.get(PLACEMENT_LABEL_KEY));
    let new = new_labels.and_then(|labels| labels.get(PLACEMENT_LABEL_KEY));
    if old != new {
        return Err(format!("The label {PLACEMENT_LABEL_KEY} is not allowed to update its value"));
    }
    Ok(())
}
