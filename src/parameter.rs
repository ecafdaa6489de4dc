//! Gate parameters and their measurement properties.
//!
//! A measurement is described per *gate* (a named experimental terminal).
//! Each gate has one or more parameters drawn from a fixed vocabulary
//! ([`PARAMETER_NAMES`]), and each parameter carries a [`PropertySpec`]
//! saying what role it plays and how it is driven:
//!
//! ```json
//! {
//!   "G1":  {"voltage": {"type": "dynamic", "start": 0.0, "stop": 1.0, "num_points": 5, "delay": 0.01}},
//!   "G2":  {"voltage": {"type": "static", "value": 0.3}},
//!   "DMM": {"current": {"type": "gettable", "break_conditions": ["val > 1e-9"]}}
//! }
//! ```
//!
//! The [`ParameterStore`] keeps the gates in the order they were declared and
//! binds each parameter to a hardware [`Channel`](crate::hardware::Channel)
//! once the external mapping step has chosen one.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::core::{ParameterId, ParameterValue};
use crate::error::{AppResult, DaqError};
use crate::hardware::SharedChannel;

/// Parameter names a gate may declare.
pub const PARAMETER_NAMES: &[&str] = &[
    "voltage",
    "current",
    "current_x_component",
    "current_y_component",
    "current_compliance",
    "amplitude",
    "frequency",
    "output_enabled",
    "time_constant",
    "phase",
    "count",
    "aux_voltage_1",
    "aux_voltage_2",
];

/// Whether `name` is one of the known parameter names.
pub fn is_valid_parameter_name(name: &str) -> bool {
    PARAMETER_NAMES.contains(&name)
}

// =============================================================================
// Roles
// =============================================================================

/// How a parameter takes part in a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Held at a fixed value
    Static,
    /// Swept along a trajectory
    Dynamic,
    /// Recorded at every point
    Gettable,
}

impl Role {
    /// Lowercase role name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Static => "static",
            Role::Dynamic => "dynamic",
            Role::Gettable => "gettable",
        }
    }
}

/// The set of roles a parameter plays.
///
/// Parsed from free text by substring membership, so `"static gettable"`,
/// `"static,gettable"` and `"dynamic_gettable"` all work. A list of role
/// names is accepted as well.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RoleText", into = "String")]
pub struct RoleSet(BTreeSet<Role>);

impl RoleSet {
    /// An empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `role` to the set.
    pub fn with(mut self, role: Role) -> Self {
        self.0.insert(role);
        self
    }

    /// Whether `role` is in the set.
    pub fn contains(&self, role: Role) -> bool {
        self.0.contains(&role)
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Roles in `static`, `dynamic`, `gettable` order.
    pub fn iter(&self) -> impl Iterator<Item = Role> + '_ {
        self.0.iter().copied()
    }
}

impl FromStr for RoleSet {
    type Err = DaqError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let lower = text.to_ascii_lowercase();
        Ok([Role::Static, Role::Dynamic, Role::Gettable]
            .into_iter()
            .filter(|role| lower.contains(role.as_str()))
            .fold(RoleSet::new(), RoleSet::with))
    }
}

impl fmt::Display for RoleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(Role::as_str).collect();
        f.write_str(&names.join(" "))
    }
}

impl From<RoleSet> for String {
    fn from(value: RoleSet) -> Self {
        value.to_string()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RoleText {
    Text(String),
    List(Vec<String>),
}

impl TryFrom<RoleText> for RoleSet {
    type Error = DaqError;

    fn try_from(value: RoleText) -> Result<Self, Self::Error> {
        match value {
            RoleText::Text(text) => text.parse(),
            RoleText::List(items) => items.join(" ").parse(),
        }
    }
}

// =============================================================================
// Break conditions
// =============================================================================

/// Comparison operator of a [`BreakCondition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// `>`
    Greater,
    /// `>=`
    GreaterEqual,
    /// `<`
    Less,
    /// `<=`
    LessEqual,
    /// `==`
    Equal,
    /// `!=`
    NotEqual,
}

impl Comparison {
    fn symbol(&self) -> &'static str {
        match self {
            Comparison::Greater => ">",
            Comparison::GreaterEqual => ">=",
            Comparison::Less => "<",
            Comparison::LessEqual => "<=",
            Comparison::Equal => "==",
            Comparison::NotEqual => "!=",
        }
    }
}

/// Stop condition on a gettable channel, written as `"val > 1.5"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BreakCondition {
    /// Operator
    pub comparison: Comparison,
    /// Value the reading is compared against
    pub threshold: f64,
}

impl BreakCondition {
    /// Whether `value` meets the condition.
    pub fn is_met(&self, value: f64) -> bool {
        match self.comparison {
            Comparison::Greater => value > self.threshold,
            Comparison::GreaterEqual => value >= self.threshold,
            Comparison::Less => value < self.threshold,
            Comparison::LessEqual => value <= self.threshold,
            Comparison::Equal => value == self.threshold,
            Comparison::NotEqual => value != self.threshold,
        }
    }
}

impl FromStr for BreakCondition {
    type Err = DaqError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let invalid = || DaqError::InvalidBreakCondition(text.to_string());
        let rest = text.trim();
        let rest = rest.strip_prefix("val").unwrap_or(rest).trim_start();

        // Two-character operators first so ">=" is not read as ">"
        let operators = [
            (">=", Comparison::GreaterEqual),
            ("<=", Comparison::LessEqual),
            ("==", Comparison::Equal),
            ("!=", Comparison::NotEqual),
            (">", Comparison::Greater),
            ("<", Comparison::Less),
        ];
        let (comparison, number) = operators
            .iter()
            .find_map(|(symbol, comparison)| {
                rest.strip_prefix(*symbol).map(|number| (*comparison, number))
            })
            .ok_or_else(invalid)?;
        let threshold = number.trim().parse::<f64>().map_err(|_| invalid())?;

        Ok(Self {
            comparison,
            threshold,
        })
    }
}

impl TryFrom<String> for BreakCondition {
    type Error = DaqError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for BreakCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "val {} {}", self.comparison.symbol(), self.threshold)
    }
}

impl From<BreakCondition> for String {
    fn from(value: BreakCondition) -> Self {
        value.to_string()
    }
}

// =============================================================================
// PropertySpec
// =============================================================================

/// Per-parameter measurement properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertySpec {
    /// Roles the parameter plays
    #[serde(alias = "type")]
    pub role: RoleSet,
    /// Fixed value, or the initial setpoint of a dynamic parameter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<ParameterValue>,
    /// Sweep start
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<f64>,
    /// Sweep stop
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<f64>,
    /// Point count of an unbuffered sweep
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_points: Option<usize>,
    /// Explicit sweep setpoints
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setpoints: Option<Vec<f64>>,
    /// Delay after each setpoint, in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<f64>,
    /// Conditions that end a sweep early
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub break_conditions: Vec<BreakCondition>,
}

impl PropertySpec {
    /// A specification with only `roles` set.
    pub fn with_role(roles: RoleSet) -> Self {
        Self {
            role: roles,
            ..Default::default()
        }
    }

    /// Whether the parameter plays `role`.
    pub fn is(&self, role: Role) -> bool {
        self.role.contains(role)
    }

    /// First of `value`, `start`, `setpoints[0]` that is present.
    pub fn initial_setpoint(&self) -> Option<ParameterValue> {
        self.value
            .clone()
            .or_else(|| self.start.map(ParameterValue::Float))
            .or_else(|| {
                self.setpoints
                    .as_ref()
                    .and_then(|s| s.first())
                    .map(|v| ParameterValue::Float(*v))
            })
    }
}

// =============================================================================
// ParameterStore
// =============================================================================

/// One declared gate parameter and the channel it is bound to.
#[derive(Clone)]
pub struct GateParameter {
    /// Gate and parameter name
    pub id: ParameterId,
    /// Parameter specification
    pub spec: PropertySpec,
    /// Channel the parameter is mapped to, once mapped
    pub channel: Option<SharedChannel>,
}

impl fmt::Debug for GateParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateParameter")
            .field("id", &self.id)
            .field("spec", &self.spec)
            .field("channel", &self.channel.as_ref().map(|c| c.id().to_string()))
            .finish()
    }
}

/// Ordered collection of gate parameters.
#[derive(Debug, Clone, Default)]
pub struct ParameterStore {
    parameters: Vec<GateParameter>,
}

impl ParameterStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `gate -> parameter -> properties` JSON, keeping declaration order.
    pub fn from_json(value: &serde_json::Value) -> AppResult<Self> {
        let gates = value.as_object().ok_or_else(|| {
            DaqError::MalformedGateMapping("expected an object of gates".to_string())
        })?;

        let mut store = Self::new();
        for (gate, parameters) in gates {
            let parameters = parameters.as_object().ok_or_else(|| {
                DaqError::MalformedGateMapping(format!(
                    "gate '{gate}' must map parameter names to properties"
                ))
            })?;
            for (parameter, properties) in parameters {
                let spec: PropertySpec = serde_json::from_value(properties.clone())?;
                store.add_gate_parameter(gate, parameter, spec)?;
            }
        }
        Ok(store)
    }

    /// Parse from a JSON string.
    pub fn from_json_str(text: &str) -> AppResult<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        Self::from_json(&value)
    }

    /// Declare a parameter of a gate.
    pub fn add_gate_parameter(
        &mut self,
        gate: &str,
        parameter: &str,
        spec: PropertySpec,
    ) -> AppResult<()> {
        if !is_valid_parameter_name(parameter) {
            return Err(DaqError::UnknownParameterName(parameter.to_string()));
        }
        let id = ParameterId::new(gate, parameter);
        if self.get(&id).is_some() {
            return Err(DaqError::DuplicateParameter {
                gate: gate.to_string(),
                parameter: parameter.to_string(),
            });
        }
        self.parameters.push(GateParameter {
            id,
            spec,
            channel: None,
        });
        Ok(())
    }

    /// Bind a declared parameter to a hardware channel.
    pub fn map_channel(&mut self, id: &ParameterId, channel: SharedChannel) -> AppResult<()> {
        let entry = self
            .parameters
            .iter_mut()
            .find(|p| &p.id == id)
            .ok_or_else(|| DaqError::MalformedGateMapping(format!("'{id}' is not declared")))?;
        entry.channel = Some(channel);
        Ok(())
    }

    /// Parameter by id.
    pub fn get(&self, id: &ParameterId) -> Option<&GateParameter> {
        self.parameters.iter().find(|p| &p.id == id)
    }

    /// Parameters in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &GateParameter> {
        self.parameters.iter()
    }

    /// Distinct gate names in declaration order.
    pub fn gates(&self) -> Vec<&str> {
        let mut gates: Vec<&str> = Vec::new();
        for p in &self.parameters {
            if !gates.contains(&p.id.gate.as_str()) {
                gates.push(&p.id.gate);
            }
        }
        gates
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    /// Whether the store holds no parameter.
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Properties as `gate -> parameter -> properties` JSON.
    pub fn to_json(&self) -> AppResult<serde_json::Value> {
        let mut gates = serde_json::Map::new();
        for p in &self.parameters {
            let gate = gates
                .entry(p.id.gate.clone())
                .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
            if let serde_json::Value::Object(parameters) = gate {
                parameters.insert(p.id.parameter.clone(), serde_json::to_value(&p.spec)?);
            }
        }
        Ok(serde_json::Value::Object(gates))
    }
}
