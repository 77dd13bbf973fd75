//! Purge compliance checking and the purge-trigger routine (spec §6, §4.F,
//! component H).
//!
//! A **purge condition** designates, for one fact type, the negative
//! existential whose satisfaction marks a fact of that type (and its
//! descendants) as eligible for removal — e.g. "an `Office` is purge-
//! eligible once an `Office.Deleted` naming it exists". A forward
//! specification is *purge-compliant* only if every match on a purge-
//! conditioned type carries that exact condition.

use std::collections::BTreeMap;

use crate::error::{BuildError, Result};
use crate::fact::Reference;
use crate::spec::ast::{
    Condition, ExistentialCondition, Label, LabeledGiven, Match, Projection, Specification,
    TypeName,
};
use crate::spec::validate::Schema;
use crate::store::FactStore;

/// The designated deletion existential for one fact type. `owner_label` is
/// the label `condition` uses, within its own sub-matches, to refer back
/// to the fact being tested (the convention used throughout spec §8's
/// examples is the label `x`).
#[derive(Debug, Clone, PartialEq)]
pub struct PurgeCondition {
    pub fact_type: TypeName,
    pub owner_label: Label,
    pub condition: ExistentialCondition,
}

impl PurgeCondition {
    pub fn new(
        fact_type: impl Into<TypeName>,
        owner_label: impl Into<Label>,
        condition: ExistentialCondition,
    ) -> Self {
        Self {
            fact_type: fact_type.into(),
            owner_label: owner_label.into(),
            condition,
        }
    }
}

/// Runs a sweep for `pc` over every fact of its type currently in
/// storage, returning those eligible for removal (spec §6 "Purge
/// interface", part a).
pub fn eligible_for_purge(store: &dyn FactStore, pc: &PurgeCondition) -> Result<Vec<Reference>> {
    let mut eligible = Vec::new();
    for candidate in store.by_type(&pc.fact_type)? {
        if crate::runner::existential_holds(store, &pc.owner_label, &candidate, &pc.condition)? {
            eligible.push(candidate);
        }
    }
    Ok(eligible)
}

/// A specification is purge-compliant iff every match on a type with an
/// associated purge condition carries that exact condition, and no
/// intermediate path step traverses a purge-conditioned type except
/// terminally. Violations are collected, not short-circuited, so the
/// caller sees every offending match at once (spec §6).
pub fn check_compliance(
    spec: &Specification,
    purge_conditions: &[PurgeCondition],
    schema: &dyn Schema,
) -> Result<(), BuildError> {
    let by_type: BTreeMap<&str, &PurgeCondition> = purge_conditions
        .iter()
        .map(|pc| (pc.fact_type.as_str(), pc))
        .collect();

    let mut diagnostics = Vec::new();
    check_matches(&spec.matches, &by_type, schema, &mut diagnostics);
    check_nested_projection(&spec.projection, &by_type, schema, &mut diagnostics);

    if diagnostics.is_empty() {
        Ok(())
    } else {
        Err(BuildError::PurgeComplianceFailure(diagnostics))
    }
}

fn check_matches(
    matches: &[Match],
    by_type: &BTreeMap<&str, &PurgeCondition>,
    schema: &dyn Schema,
    diagnostics: &mut Vec<String>,
) {
    for m in matches {
        if let Some(pc) = by_type.get(m.fact_type.as_str()) {
            if !carries_condition(m, &pc.condition) {
                diagnostics.push(format!(
                    "match `{}` on purge-conditioned type `{}` is missing its purge condition",
                    m.unknown, m.fact_type
                ));
            }
        }
        for condition in &m.conditions {
            if let Condition::Existential(e) = condition {
                check_matches(&e.matches, by_type, schema, diagnostics);
            }
        }
        check_intermediate_path_steps(m, by_type, schema, diagnostics);
    }
}

/// A match whose path condition walks *through* (not merely *to*) a
/// purge-conditioned type via an intermediate role step is non-compliant
/// unless that step is the chain's terminal step.
fn check_intermediate_path_steps(
    m: &Match,
    by_type: &BTreeMap<&str, &PurgeCondition>,
    schema: &dyn Schema,
    diagnostics: &mut Vec<String>,
) {
    for condition in &m.conditions {
        let Condition::Path(p) = condition else { continue };
        for (label, roles) in [(&p.left_label, &p.left_roles), (&p.right_label, &p.right_roles)] {
            if roles.len() < 2 {
                continue;
            }
            let mut current_type = m.fact_type.clone();
            for (i, role) in roles.iter().enumerate() {
                let is_terminal = i == roles.len() - 1;
                if !is_terminal {
                    if let Some(next_type) = schema.role_target(&current_type, role) {
                        if by_type.contains_key(next_type.as_str()) {
                            diagnostics.push(format!(
                                "path through `{label}` traverses purge-conditioned type `{next_type}` non-terminally"
                            ));
                        }
                        current_type = next_type;
                    }
                }
            }
        }
    }
}

fn check_nested_projection(
    projection: &crate::spec::ast::Projection,
    by_type: &BTreeMap<&str, &PurgeCondition>,
    schema: &dyn Schema,
    diagnostics: &mut Vec<String>,
) {
    use crate::spec::ast::Projection;
    match projection {
        Projection::Specification(nested) => {
            check_matches(&nested.matches, by_type, schema, diagnostics);
            check_nested_projection(&nested.projection, by_type, schema, diagnostics);
        }
        Projection::Composite(entries) => {
            for (_, p) in entries {
                check_nested_projection(p, by_type, schema, diagnostics);
            }
        }
        Projection::Label(_) | Projection::Field { .. } | Projection::FactTime(_) => {}
    }
}

fn carries_condition(m: &Match, required: &ExistentialCondition) -> bool {
    m.conditions.iter().any(|c| match c {
        Condition::Existential(e) => {
            e.exists == required.exists && matches_same_shape(&e.matches, &required.matches)
        }
        Condition::Path(_) => false,
    })
}

/// Structural comparison ignoring the specific label names bound by each
/// side (the caller's condition and the registered purge condition are
/// written independently and may use different label names for the same
/// shape).
fn matches_same_shape(a: &[Match], b: &[Match]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).all(|(x, y)| x.fact_type == y.fact_type && x.conditions.len() == y.conditions.len())
}

/// The outcome of running a purge-inverse over a newly saved fact: the
/// root fact eligible for removal and the set of facts to keep despite
/// being descendants of it (typically the very fact whose arrival
/// triggered the purge, e.g. the `Office.Deleted` record itself).
#[derive(Debug, Clone, PartialEq)]
pub struct PurgeTrigger {
    pub purge_root: crate::fact::Reference,
    pub triggers: Vec<crate::fact::Reference>,
}

impl PurgeTrigger {
    pub fn new(purge_root: crate::fact::Reference, triggers: Vec<crate::fact::Reference>) -> Self {
        Self { purge_root, triggers }
    }
}

/// Builds the purge-inverse specification for `pc` (spec §6(b)): a
/// specification whose sole given is the deletion witness (e.g.
/// `X.Deleted`) and whose sole match rediscovers the purge root it marks
/// for removal. Running this specification with a newly arrived witness
/// fact bound as the given yields the root's reference as its projection.
///
/// The witness's own path condition (e.g. `d->x = x`) is attached to the
/// *root* match rather than left on the given: a given's conditions are
/// pruned before any match runs, so a condition naming the not-yet-bound
/// root would always fail there. Attached to the root match instead, it
/// drives the same index-driven join the runner already uses to expand an
/// ordinary match (`crate::runner::candidates_for_match`).
pub fn purge_inverse_specification(pc: &PurgeCondition) -> Specification {
    let witness = &pc.condition.matches[0];
    let given = LabeledGiven::new(witness.unknown.clone(), witness.fact_type.clone());
    let root_match = Match::new(pc.owner_label.clone(), pc.fact_type.clone())
        .with_conditions(witness.conditions.clone());
    Specification::new(
        vec![given],
        vec![root_match],
        Projection::Label(pc.owner_label.clone()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::parse;
    use crate::spec::validate::Schema;

    struct NoSchema;
    impl Schema for NoSchema {
        fn role_target(&self, _fact_type: &str, _role: &str) -> Option<String> {
            None
        }
    }

    fn deleted_condition() -> ExistentialCondition {
        ExistentialCondition {
            exists: false,
            matches: vec![Match::new("d", "X.Deleted")
                .with_conditions(vec![Condition::Path(crate::spec::ast::PathCondition::new(
                    "d",
                    vec!["x".to_string()],
                    "x",
                    vec![],
                ))])],
        }
    }

    #[test]
    fn flags_missing_purge_condition() {
        let spec = parse("(x: X) { y: X [ y = x ] } => y").unwrap();
        let pc = PurgeCondition::new("X", "x", deleted_condition());
        let err = check_compliance(&spec, &[pc], &NoSchema).unwrap_err();
        assert!(matches!(err, BuildError::PurgeComplianceFailure(_)));
    }

    #[test]
    fn accepts_spec_carrying_exact_condition() {
        let spec = parse(
            "(x: X) { y: X [ y = x, !E { d: X.Deleted [ d->x = y ] } ] } => y",
        )
        .unwrap();
        let pc = PurgeCondition::new("X", "x", deleted_condition());
        assert!(check_compliance(&spec, &[pc], &NoSchema).is_ok());
    }

    /// Running the purge-inverse with a newly arrived `X.Deleted` witness
    /// bound as the given rediscovers the `X` fact it marks for removal
    /// (spec §6(b)'s "the tuple identifies a purgeRoot").
    #[test]
    fn purge_inverse_specification_finds_root_from_witness() {
        use crate::fact::{Fact, FactEnvelope, PredecessorValue, Scalar};
        use crate::store::redb_store::RedbFactStore;
        use std::collections::BTreeMap;

        let store = RedbFactStore::open_in_memory().unwrap();
        let x = Fact::new("X", BTreeMap::new(), {
            let mut fields = BTreeMap::new();
            fields.insert("name".to_string(), Scalar::from("root"));
            fields
        })
        .unwrap();
        let x_ref = x.reference();
        let mut preds = BTreeMap::new();
        preds.insert("x".to_string(), PredecessorValue::Single(x_ref.clone()));
        let deleted = Fact::new("X.Deleted", preds, BTreeMap::new()).unwrap();
        let deleted_ref = deleted.reference();

        store
            .save(vec![FactEnvelope::new(x), FactEnvelope::new(deleted)])
            .unwrap();

        let pc = PurgeCondition::new("X", "x", deleted_condition());
        let inverse_spec = purge_inverse_specification(&pc);
        assert_eq!(inverse_spec.given[0].fact_type, "X.Deleted");

        let results = crate::runner::run(&store, &[deleted_ref], &inverse_spec).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0].projection,
            crate::store::ProjectedValue::Reference(x_ref)
        );
    }
}
