//! Specification inversion (spec §4.F, component F).
//!
//! Given a forward [`Specification`], derive the set of **inverse
//! specifications** that let the observer (`crate::observer`) learn exactly
//! which existing results a newly arrived fact adds or removes, without
//! re-running the whole forward query on every save. Each inverse is itself
//! an ordinary `Specification` whose sole given is the arrived fact's type —
//! run it with that fact bound as the given and its results are exactly the
//! outer tuples the arrival affects.
//!
//! The inverter never touches storage; it is pure AST transformation, built
//! the same way `crate::spec::validate` walks a specification recursively
//! and accumulates diagnostics — here accumulating inverses instead.

use crate::spec::ast::{Condition, ExistentialCondition, Label, Match, Projection, Specification};

/// One step locating a nested projection within a specification's
/// projection tree. The observer uses a sequence of these to route a
/// notification to the correct nested collection handle (spec §4.G.3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathStep {
    /// Descend into the projection held at this composite entry's name.
    Composite(String),
    /// Descend into a nested collection (`Projection::Specification`).
    Collection,
}

/// A step locating a nested projection, root to leaf.
pub type Path = Vec<PathStep>;

/// How a notification from this inverse should be applied to the outer
/// result set. `MaybeAdd`/`MaybeRemove` mean the arrival is necessary but
/// not sufficient — the observer must re-check the originating existential
/// before acting, since another witness may already have settled it (spec
/// §4.G.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Add,
    MaybeAdd,
    Remove,
    MaybeRemove,
}

/// One derived inverse (spec §4.F).
///
/// `result_subset` is the label subset the notification key is hashed over
/// (`crate::observer`'s `hash(tuple restricted to result_subset)`) — it must
/// never be empty. A specification with no matches of its own (a "self
/// inverse": a pure predecessor walk, or a nested projection that only
/// re-echoes an outer label) inherits the *enclosing* scope's
/// `result_subset` rather than computing its own as empty; computing it as
/// empty would hash every such tuple to the same key and collide distinct
/// removals onto each other.
#[derive(Debug, Clone, PartialEq)]
pub struct InverseSpecification {
    pub inverse_specification: Specification,
    pub operation: Operation,
    pub given_subset: Vec<Label>,
    pub result_subset: Vec<Label>,
    pub parent_subset: Vec<Label>,
    pub path: Path,
}

/// Derives every inverse specification for `spec` (spec §4.F).
pub fn invert(spec: &Specification) -> Vec<InverseSpecification> {
    let top_level_scope: Vec<Label> = spec.given.iter().map(|g| g.label.clone()).collect();
    invert_scoped(spec, &top_level_scope, &[], &[])
}

/// The labels a tuple satisfying `spec` binds, in no particular order.
fn spec_labels(spec: &Specification) -> Vec<Label> {
    let mut labels: Vec<Label> = spec.given.iter().map(|g| g.label.clone()).collect();
    labels.extend(spec.matches.iter().map(|m| m.unknown.clone()));
    labels
}

/// The label subset a notification at this scope is keyed on: the labels
/// this specification's own matches introduce, or — when it introduces
/// none — the enclosing scope's subset (the self-inverse fix described on
/// [`InverseSpecification`]).
fn effective_result_subset(spec: &Specification, enclosing: &[Label]) -> Vec<Label> {
    if spec.matches.is_empty() {
        enclosing.to_vec()
    } else {
        spec.matches.iter().map(|m| m.unknown.clone()).collect()
    }
}

fn invert_scoped(
    spec: &Specification,
    enclosing_result_subset: &[Label],
    parent_subset: &[Label],
    path: &[PathStep],
) -> Vec<InverseSpecification> {
    let mut inverses = Vec::new();
    let result_subset = effective_result_subset(spec, enclosing_result_subset);

    for g in &spec.given {
        invert_conditions(
            &g.conditions,
            &g.label,
            spec,
            &result_subset,
            parent_subset,
            path,
            &mut inverses,
        );
    }

    for idx in 0..spec.matches.len() {
        inverses.push(invert_match(spec, idx, &result_subset, parent_subset, path));
        let conditions = spec.matches[idx].conditions.clone();
        let owner_label = spec.matches[idx].unknown.clone();
        invert_conditions(
            &conditions,
            &owner_label,
            spec,
            &result_subset,
            parent_subset,
            path,
            &mut inverses,
        );
    }

    invert_projection(
        &spec.projection,
        &result_subset,
        &spec_labels(spec),
        path,
        &mut inverses,
    );

    inverses
}

/// Builds the inverse for the arrival of a fact matching `spec.matches[idx]`
/// itself: the new fact becomes the inverse's sole given, and every other
/// label `spec` binds (its own given, and its other matches) is
/// reconstructed around it unchanged, so running the inverse recovers
/// exactly the outer tuples the arrival completes.
fn invert_match(
    spec: &Specification,
    idx: usize,
    result_subset: &[Label],
    parent_subset: &[Label],
    path: &[PathStep],
) -> InverseSpecification {
    let target = &spec.matches[idx];

    let new_given = crate::spec::ast::LabeledGiven::new(target.unknown.clone(), target.fact_type.clone())
        .with_conditions(target.conditions.clone());

    let mut new_matches: Vec<Match> = spec
        .given
        .iter()
        .map(|g| Match::new(g.label.clone(), g.fact_type.clone()).with_conditions(g.conditions.clone()))
        .collect();
    new_matches.extend(
        spec.matches
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != idx)
            .map(|(_, m)| m.clone()),
    );

    let inverse_spec = Specification::new(vec![new_given], new_matches, spec.projection.clone());

    let operation = if target
        .conditions
        .iter()
        .any(|c| matches!(c, Condition::Existential(_)))
    {
        Operation::MaybeAdd
    } else {
        Operation::Add
    };

    InverseSpecification {
        inverse_specification: inverse_spec,
        operation,
        given_subset: spec.given.iter().map(|g| g.label.clone()).collect(),
        result_subset: result_subset.to_vec(),
        parent_subset: parent_subset.to_vec(),
        path: path.to_vec(),
    }
}

/// Walks every existential attached to one label's conditions, recursing
/// into each existential's own inner matches' conditions in turn, so a
/// `!E` nested inside another `!E` yields an inverse at each depth.
/// `owner_label` is whichever label (given or match) `conditions` belongs
/// to, needed to know which reconstructed match to adjust for a negative
/// existential (see [`invert_existential_match`]).
fn invert_conditions(
    conditions: &[Condition],
    owner_label: &str,
    spec: &Specification,
    result_subset: &[Label],
    parent_subset: &[Label],
    path: &[PathStep],
    out: &mut Vec<InverseSpecification>,
) {
    for condition in conditions {
        let Condition::Existential(existential) = condition else {
            continue;
        };
        for idx in 0..existential.matches.len() {
            out.push(invert_existential_match(
                spec,
                owner_label,
                existential,
                idx,
                result_subset,
                parent_subset,
                path,
            ));
            let inner_conditions = existential.matches[idx].conditions.clone();
            let inner_owner = existential.matches[idx].unknown.clone();
            invert_conditions(
                &inner_conditions,
                &inner_owner,
                spec,
                result_subset,
                parent_subset,
                path,
                out,
            );
        }
    }
}

/// Builds the inverse for the arrival of a fact witnessing one match inside
/// an existential condition: the witness becomes the inverse's given, and
/// `spec`'s own given and matches are reconstructed around it so the
/// resulting tuple is the one the existential's truth bears on.
///
/// For a negative existential, `owner_label`'s own copy of this exact `!E`
/// condition is dropped before reconstruction: the witness that just
/// arrived is what makes `!E` false, so re-checking it unmodified would
/// always filter the very tuple this inverse exists to report out of its
/// own results, and the removal would never be observed. A positive
/// existential needs no such adjustment — re-evaluating it unmodified is
/// exactly the "does it now hold" check an add inverse wants.
fn invert_existential_match(
    spec: &Specification,
    owner_label: &str,
    existential: &ExistentialCondition,
    idx: usize,
    result_subset: &[Label],
    parent_subset: &[Label],
    path: &[PathStep],
) -> InverseSpecification {
    let witness = &existential.matches[idx];

    let new_given =
        crate::spec::ast::LabeledGiven::new(witness.unknown.clone(), witness.fact_type.clone())
            .with_conditions(witness.conditions.clone());

    let target_condition = Condition::Existential(existential.clone());
    let owner_conditions = |original: &[Condition]| -> Vec<Condition> {
        if existential.exists {
            original.to_vec()
        } else {
            original
                .iter()
                .filter(|c| **c != target_condition)
                .cloned()
                .collect()
        }
    };

    let mut new_matches: Vec<Match> = spec
        .given
        .iter()
        .map(|g| {
            let conditions = if g.label == owner_label {
                owner_conditions(&g.conditions)
            } else {
                g.conditions.clone()
            };
            Match::new(g.label.clone(), g.fact_type.clone()).with_conditions(conditions)
        })
        .collect();
    new_matches.extend(spec.matches.iter().map(|m| {
        if m.unknown == owner_label {
            Match::new(m.unknown.clone(), m.fact_type.clone())
                .with_conditions(owner_conditions(&m.conditions))
        } else {
            m.clone()
        }
    }));

    let inverse_spec = Specification::new(vec![new_given], new_matches, spec.projection.clone());

    let operation = if existential.exists {
        Operation::MaybeAdd
    } else {
        Operation::Remove
    };

    InverseSpecification {
        inverse_specification: inverse_spec,
        operation,
        given_subset: spec.given.iter().map(|g| g.label.clone()).collect(),
        result_subset: result_subset.to_vec(),
        parent_subset: parent_subset.to_vec(),
        path: path.to_vec(),
    }
}

/// Recurses into a projection tree, descending through composites and
/// nested collections, inverting each nested specification it finds with
/// its own scope (spec §4.F "inverses composing for nested projection
/// collections").
fn invert_projection(
    projection: &Projection,
    result_subset: &[Label],
    available_labels: &[Label],
    path: &[PathStep],
    out: &mut Vec<InverseSpecification>,
) {
    match projection {
        Projection::Specification(nested) => {
            let mut nested_path = path.to_vec();
            nested_path.push(PathStep::Collection);
            out.extend(invert_scoped(
                nested,
                result_subset,
                available_labels,
                &nested_path,
            ));
        }
        Projection::Composite(entries) => {
            for (name, p) in entries {
                let mut nested_path = path.to_vec();
                nested_path.push(PathStep::Composite(name.clone()));
                invert_projection(p, result_subset, available_labels, &nested_path, out);
            }
        }
        Projection::Label(_) | Projection::Field { .. } | Projection::FactTime(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::parse;

    #[test]
    fn single_match_produces_one_add_inverse() {
        let spec = parse("(company: Company) { o: Office [ o->company = company ] } => o").unwrap();
        let inverses = invert(&spec);
        assert_eq!(inverses.len(), 1);
        assert_eq!(inverses[0].operation, Operation::Add);
        assert_eq!(inverses[0].inverse_specification.given.len(), 1);
        assert_eq!(inverses[0].inverse_specification.given[0].fact_type, "Office");
    }

    #[test]
    fn negative_existential_yields_add_and_remove_inverses() {
        let spec = parse(
            "(company: Company) { o: Office [ o->company = company, !E { cl: Office.Closed [ cl->office = o ] } ] } => o",
        )
        .unwrap();
        let inverses = invert(&spec);

        let office_given = inverses
            .iter()
            .find(|i| i.inverse_specification.given[0].fact_type == "Office")
            .expect("expected an inverse rooted at Office");
        assert_eq!(office_given.operation, Operation::MaybeAdd);

        let closure_given = inverses
            .iter()
            .find(|i| i.inverse_specification.given[0].fact_type == "Office.Closed")
            .expect("expected an inverse rooted at Office.Closed");
        assert_eq!(closure_given.operation, Operation::Remove);
        assert_eq!(inverses.len(), 2);
    }

    #[test]
    fn nested_collection_with_negative_existential_inverts_at_its_own_scope() {
        let spec = parse(
            "(company: Company) { o: Office [ o->company = company ] } => { identifier = o.identifier, managers = (owner: Office [ owner = o, !E { cl: Office.Closed [ cl->office = owner ] } ]) { } => owner }",
        )
        .unwrap();
        let inverses = invert(&spec);

        let nested_remove = inverses
            .iter()
            .find(|i| {
                i.operation == Operation::Remove
                    && i.inverse_specification.given[0].fact_type == "Office.Closed"
            })
            .expect("expected a nested Remove inverse for the closure witness");
        assert_eq!(nested_remove.path, vec![
            PathStep::Composite("managers".to_string()),
            PathStep::Collection,
        ]);
    }

    #[test]
    fn self_inverse_inherits_enclosing_result_subset_instead_of_empty() {
        use crate::spec::ast::LabeledGiven;

        let nested = Specification::new(
            vec![LabeledGiven::new("o", "Office").with_conditions(vec![Condition::Existential(
                ExistentialCondition {
                    exists: false,
                    matches: vec![Match::new("cl", "Office.Closed").with_conditions(vec![
                        Condition::Path(crate::spec::ast::PathCondition::new(
                            "cl",
                            vec!["office".to_string()],
                            "o",
                            vec![],
                        )),
                    ])],
                },
            )]),
            vec![],
            Projection::Label("o".to_string()),
        );

        let enclosing = vec!["o".to_string()];
        assert!(nested.matches.is_empty(), "this scope introduces no match of its own");
        assert_eq!(effective_result_subset(&nested, &enclosing), enclosing);

        let inverses = invert_scoped(&nested, &enclosing, &[], &[PathStep::Collection]);
        assert_eq!(inverses.len(), 1);
        assert_eq!(inverses[0].result_subset, enclosing);
        assert!(!inverses[0].result_subset.is_empty());
    }
}
