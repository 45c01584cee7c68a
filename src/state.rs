//! Internal state/decision model decoded from simulation-step responses.
//!
//! The engine describes a state as a binary location tree plus a symbolic
//! clock zone, and offers a set of candidate decisions. This module
//! flattens the tree into per-component locations and normalizes raw
//! clock-difference bounds into clock-comparator constraints.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use crate::transport::proto;

/// Orientation of a normalized clock constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    /// `left < right + constant` (or `<=` when not strict).
    LessThan,
    /// `left > right + constant` (or `>=` when not strict).
    GreaterThan,
}

/// A clock constraint in clock-comparator form.
///
/// Normalization always orients the inequality so the constant is
/// non-negative; `right` is absent when the bound compares one clock
/// against the constant alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockConstraint {
    /// Clock on the left-hand side.
    pub left: String,
    /// Optional clock on the right-hand side.
    pub right: Option<String>,
    /// Non-negative constant term.
    pub constant: i32,
    /// Inequality orientation.
    pub comparator: Comparator,
    /// Strict (`<`/`>`) or non-strict (`<=`/`>=`).
    pub strict: bool,
}

impl ClockConstraint {
    /// Normalizes a raw clock-difference bound `x - y <= c`.
    ///
    /// The distinguished zero clock is an empty name: a zero `x` yields
    /// `y > |c|`, a zero `y` yields `x < |c|`; with two real clocks the
    /// inequality is oriented so the constant stays non-negative.
    #[must_use]
    pub fn normalize(raw: &proto::Constraint) -> Self {
        let strict = raw.strict;
        if raw.x.is_empty() {
            return Self {
                left: raw.y.clone(),
                right: None,
                constant: raw.c.abs(),
                comparator: Comparator::GreaterThan,
                strict,
            };
        }
        if raw.y.is_empty() {
            return Self {
                left: raw.x.clone(),
                right: None,
                constant: raw.c.abs(),
                comparator: Comparator::LessThan,
                strict,
            };
        }
        if raw.c >= 0 {
            Self {
                left: raw.x.clone(),
                right: Some(raw.y.clone()),
                constant: raw.c,
                comparator: Comparator::LessThan,
                strict,
            }
        } else {
            Self {
                left: raw.y.clone(),
                right: Some(raw.x.clone()),
                constant: raw.c.abs(),
                comparator: Comparator::GreaterThan,
                strict,
            }
        }
    }
}

impl fmt::Display for ClockConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match (self.comparator, self.strict) {
            (Comparator::LessThan, true) => "<",
            (Comparator::LessThan, false) => "<=",
            (Comparator::GreaterThan, true) => ">",
            (Comparator::GreaterThan, false) => ">=",
        };
        match &self.right {
            Some(right) if self.constant != 0 => {
                write!(f, "{} {symbol} {right} + {}", self.left, self.constant)
            }
            Some(right) => write!(f, "{} {symbol} {right}", self.left),
            None => write!(f, "{} {symbol} {}", self.left, self.constant),
        }
    }
}

/// One candidate next step offered by the engine.
#[derive(Debug, Clone)]
pub struct Decision {
    composition: String,
    edge_ids: Vec<String>,
    action: String,
    constraints: Vec<ClockConstraint>,
    raw: Option<proto::Decision>,
}

impl Decision {
    /// The synthetic decision that starts a fresh simulation run.
    #[must_use]
    pub fn initial(composition: impl Into<String>) -> Self {
        Self {
            composition: composition.into(),
            edge_ids: Vec::new(),
            action: String::new(),
            constraints: Vec::new(),
            raw: None,
        }
    }

    /// Composition string this decision belongs to.
    #[must_use]
    pub fn composition(&self) -> &str {
        &self.composition
    }

    /// Ids of the edges the decision represents.
    #[must_use]
    pub fn edge_ids(&self) -> &[String] {
        &self.edge_ids
    }

    /// Action label of the decision.
    #[must_use]
    pub fn action(&self) -> &str {
        &self.action
    }

    /// Clock constraints of the decision's own source zone.
    #[must_use]
    pub fn constraints(&self) -> &[ClockConstraint] {
        &self.constraints
    }

    /// Raw payload replayed to the engine when this decision is taken.
    /// Absent only for the synthetic initial decision.
    #[must_use]
    pub fn raw(&self) -> Option<&proto::Decision> {
        self.raw.as_ref()
    }

    /// Whether this is the synthetic initial decision.
    #[must_use]
    pub const fn is_initial(&self) -> bool {
        self.raw.is_none()
    }
}

/// One simulation state: per-component locations, the state's clock
/// constraints and the decisions available from it. Immutable once built.
#[derive(Debug, Clone)]
pub struct State {
    locations: BTreeMap<String, String>,
    constraints: Vec<ClockConstraint>,
    decisions: Vec<Decision>,
}

impl State {
    /// Current leaf location id per component instance.
    #[must_use]
    pub fn locations(&self) -> &BTreeMap<String, String> {
        &self.locations
    }

    /// Normalized clock constraints of the state's zone.
    #[must_use]
    pub fn constraints(&self) -> &[ClockConstraint] {
        &self.constraints
    }

    /// Candidate decisions offered from this state.
    #[must_use]
    pub fn decisions(&self) -> &[Decision] {
        &self.decisions
    }
}

/// Decodes a simulation-step response into a [`State`].
#[must_use]
pub fn create_state(composition: &str, response: &proto::SimulationStepResponse) -> State {
    State {
        locations: decode_locations(response),
        constraints: decode_source_constraints(response),
        decisions: decode_decisions(composition, response),
    }
}

/// Decodes the first response of a fresh simulation run.
///
/// Initial states carry no clock constraints: initial invariants are not
/// yet derived from the model.
#[must_use]
pub fn create_initial_state(composition: &str, response: &proto::SimulationStepResponse) -> State {
    State {
        locations: decode_locations(response),
        constraints: Vec::new(),
        decisions: decode_decisions(composition, response),
    }
}

/// Breadth-first collection of leaf locations, starting at the first
/// decision point's source state.
fn decode_locations(response: &proto::SimulationStepResponse) -> BTreeMap<String, String> {
    let mut locations = BTreeMap::new();
    let Some(tree) = response
        .new_decision_points
        .first()
        .and_then(|point| point.source.as_ref())
        .and_then(|source| source.location_tree.as_ref())
    else {
        return locations;
    };

    let mut queue: VecDeque<&proto::LocationTree> = VecDeque::new();
    queue.push_back(tree);
    while let Some(node) = queue.pop_front() {
        match &node.node {
            Some(proto::location_tree::Node::Leaf(leaf)) => {
                locations.insert(leaf.component_instance.clone(), leaf.id.clone());
            }
            Some(proto::location_tree::Node::Binary(binary)) => {
                if let Some(left) = binary.left.as_deref() {
                    queue.push_back(left);
                }
                if let Some(right) = binary.right.as_deref() {
                    queue.push_back(right);
                }
            }
            // Universal/inconsistent locations are accepted but not yet
            // visualized.
            Some(proto::location_tree::Node::Special(_)) | None => {}
        }
    }
    locations
}

fn decode_source_constraints(response: &proto::SimulationStepResponse) -> Vec<ClockConstraint> {
    response
        .new_decision_points
        .first()
        .and_then(|point| point.source.as_ref())
        .and_then(|source| source.zone.as_ref())
        .map(decode_zone)
        .unwrap_or_default()
}

/// Only the first conjunction of the zone's disjunctive normal form is
/// consumed; genuinely disjunctive zones are a known protocol gap.
fn decode_zone(zone: &proto::Federation) -> Vec<ClockConstraint> {
    zone.disjunction
        .first()
        .map(|conjunction| {
            conjunction
                .constraints
                .iter()
                .map(ClockConstraint::normalize)
                .collect()
        })
        .unwrap_or_default()
}

fn decode_decisions(composition: &str, response: &proto::SimulationStepResponse) -> Vec<Decision> {
    response
        .new_decision_points
        .iter()
        .map(|point| Decision {
            composition: composition.to_string(),
            edge_ids: point.edge_ids.clone(),
            action: point.action.clone(),
            constraints: point
                .source
                .as_ref()
                .and_then(|source| source.zone.as_ref())
                .map(decode_zone)
                .unwrap_or_default(),
            raw: Some(point.clone()),
        })
        .collect()
}
