//! Static specification validation (spec §3 invariants): connectedness,
//! type coherence, and forward-given-reference checks. All three run at
//! build time — a specification that fails any of them is rejected before
//! it ever reaches the runner, inverter, or observer.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::BuildError;
use crate::spec::ast::{Condition, Label, PathCondition, Projection, Specification, TypeName};

/// Caller-supplied knowledge of which fact type a predecessor role points
/// at, for a given fact type. Implemented over whatever schema registry the
/// embedding application already maintains.
pub trait Schema {
    fn role_target(&self, fact_type: &str, role: &str) -> Option<String>;
}

/// Runs every static check against `spec`, in the order a build pipeline
/// would want them reported: syntax is assumed already past (the caller
/// parsed it), so first connectedness, then forward references, then type
/// coherence.
pub fn validate(spec: &Specification, schema: &dyn Schema) -> Result<(), BuildError> {
    validate_scoped(spec, schema, &[], &BTreeMap::new())
}

/// The label subset and type map bound by `spec.given`/`spec.matches`, in
/// no particular order — the context a nested projection specification
/// needs carried in from its enclosing scope (spec §3: nested projection
/// matches participate in the same connectivity/visibility graph as the
/// rest of the specification; spec §4.E: a nested sub-specification runs
/// "using the [outer] tuple as extended givens").
fn spec_labels(spec: &Specification) -> Vec<Label> {
    let mut labels: Vec<Label> = spec.given.iter().map(|g| g.label.clone()).collect();
    labels.extend(spec.matches.iter().map(|m| m.unknown.clone()));
    labels
}

fn spec_types(spec: &Specification) -> BTreeMap<Label, TypeName> {
    let mut types = BTreeMap::new();
    for given in &spec.given {
        types.insert(given.label.clone(), given.fact_type.clone());
    }
    for m in &spec.matches {
        types.insert(m.unknown.clone(), m.fact_type.clone());
    }
    types
}

/// `validate`'s actual recursion, carrying the enclosing scope's visible
/// labels and type map so a nested projection specification can reference
/// an outer label without being rejected as an unbound forward reference.
fn validate_scoped(
    spec: &Specification,
    schema: &dyn Schema,
    outer_visible: &[Label],
    outer_types: &BTreeMap<Label, TypeName>,
) -> Result<(), BuildError> {
    check_connectedness(spec)?;
    check_forward_references(spec, outer_visible)?;
    check_types(spec, schema, outer_types)?;
    check_nested_specifications(spec, schema, outer_visible, outer_types)
}

/// Every label introduced by `spec` — givens and matches, including those
/// nested inside existential conditions — must lie in a single connected
/// component under the graph formed by its path conditions. A disconnected
/// specification can silently match the cross product of unrelated facts.
fn check_connectedness(spec: &Specification) -> Result<(), BuildError> {
    let mut uf = UnionFind::new();
    let mut labels = HashSet::new();

    for given in &spec.given {
        labels.insert(given.label.clone());
        uf.make(&given.label);
        collect_edges(&given.conditions, &mut uf, &mut labels);
    }
    for m in &spec.matches {
        labels.insert(m.unknown.clone());
        uf.make(&m.unknown);
        collect_edges(&m.conditions, &mut uf, &mut labels);
    }

    if labels.len() <= 1 {
        return Ok(());
    }

    let mut components: HashMap<String, Vec<String>> = HashMap::new();
    for label in &labels {
        let root = uf.find(label);
        components.entry(root).or_default().push(label.clone());
    }

    if components.len() > 1 {
        let mut groups: Vec<Vec<String>> = components.into_values().collect();
        for g in &mut groups {
            g.sort();
        }
        groups.sort();
        return Err(BuildError::DisconnectedSpecification(groups));
    }
    Ok(())
}

fn collect_edges(conditions: &[Condition], uf: &mut UnionFind, labels: &mut HashSet<String>) {
    for condition in conditions {
        match condition {
            Condition::Path(p) => {
                uf.make(&p.left_label);
                uf.make(&p.right_label);
                uf.union(&p.left_label, &p.right_label);
            }
            Condition::Existential(e) => {
                for m in &e.matches {
                    labels.insert(m.unknown.clone());
                    uf.make(&m.unknown);
                    collect_edges(&m.conditions, uf, labels);
                }
            }
        }
    }
}

struct UnionFind {
    parent: HashMap<String, String>,
}

impl UnionFind {
    fn new() -> Self {
        Self {
            parent: HashMap::new(),
        }
    }

    fn make(&mut self, label: &str) {
        self.parent
            .entry(label.to_string())
            .or_insert_with(|| label.to_string());
    }

    fn find(&mut self, label: &str) -> String {
        let parent = self
            .parent
            .get(label)
            .cloned()
            .unwrap_or_else(|| label.to_string());
        if parent == label {
            parent
        } else {
            let root = self.find(&parent);
            self.parent.insert(label.to_string(), root.clone());
            root
        }
    }

    fn union(&mut self, a: &str, b: &str) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent.insert(ra, rb);
        }
    }
}

/// Conditions on a given may only reference labels declared by an earlier
/// given, or a label already visible in an enclosing scope; conditions on a
/// match may reference any given or earlier match. Nothing may reference a
/// label declared later in the specification.
fn check_forward_references(spec: &Specification, outer_visible: &[Label]) -> Result<(), BuildError> {
    let mut visible: Vec<String> = outer_visible.to_vec();
    for given in &spec.given {
        check_conditions_visible(&given.label, &given.conditions, &visible)?;
        visible.push(given.label.clone());
    }
    for m in &spec.matches {
        check_conditions_visible(&m.unknown, &m.conditions, &visible)?;
        visible.push(m.unknown.clone());
    }
    Ok(())
}

fn check_conditions_visible(
    current: &str,
    conditions: &[Condition],
    visible: &[String],
) -> Result<(), BuildError> {
    for condition in conditions {
        match condition {
            Condition::Path(p) => {
                check_label_visible(current, &p.left_label, current, visible)?;
                check_label_visible(current, &p.right_label, current, visible)?;
            }
            Condition::Existential(e) => {
                let mut nested_visible = visible.to_vec();
                nested_visible.push(current.to_string());
                for m in &e.matches {
                    check_conditions_visible(&m.unknown, &m.conditions, &nested_visible)?;
                    nested_visible.push(m.unknown.clone());
                }
            }
        }
    }
    Ok(())
}

fn check_label_visible(
    owner: &str,
    referenced: &str,
    current: &str,
    visible: &[String],
) -> Result<(), BuildError> {
    if referenced == current || visible.iter().any(|l| l == referenced) {
        Ok(())
    } else {
        Err(BuildError::ForwardGivenReference {
            label: owner.to_string(),
            referenced: referenced.to_string(),
        })
    }
}

/// Walks every path condition's role chain through `schema`, confirming
/// that the fact type reached by the left-hand chain matches the type
/// reached by the right-hand chain. `outer_types` seeds the map with any
/// label already typed by an enclosing scope, so a nested specification's
/// path conditions can resolve an outer label's type.
fn check_types(
    spec: &Specification,
    schema: &dyn Schema,
    outer_types: &BTreeMap<Label, TypeName>,
) -> Result<(), BuildError> {
    let mut types = outer_types.clone();
    types.extend(spec_types(spec));
    for given in &spec.given {
        check_condition_types(&given.conditions, &types, schema)?;
    }
    for m in &spec.matches {
        check_condition_types(&m.conditions, &types, schema)?;
    }
    Ok(())
}

fn check_condition_types(
    conditions: &[Condition],
    types: &BTreeMap<String, String>,
    schema: &dyn Schema,
) -> Result<(), BuildError> {
    for condition in conditions {
        match condition {
            Condition::Path(p) => check_path_types(p, types, schema)?,
            Condition::Existential(e) => {
                let mut nested = types.clone();
                for m in &e.matches {
                    nested.insert(m.unknown.clone(), m.fact_type.clone());
                }
                for m in &e.matches {
                    check_condition_types(&m.conditions, &nested, schema)?;
                }
            }
        }
    }
    Ok(())
}

fn check_path_types(
    p: &PathCondition,
    types: &BTreeMap<String, String>,
    schema: &dyn Schema,
) -> Result<(), BuildError> {
    let left_start = types.get(&p.left_label).cloned();
    let right_start = types.get(&p.right_label).cloned();

    let left_end = left_start.and_then(|t| walk_chain(&p.left_label, &t, &p.left_roles, schema)).transpose()?;
    let right_end = right_start.and_then(|t| walk_chain(&p.right_label, &t, &p.right_roles, schema)).transpose()?;

    if let (Some(l), Some(r)) = (&left_end, &right_end) {
        if l != r {
            let role = p
                .left_roles
                .last()
                .or(p.right_roles.last())
                .cloned()
                .unwrap_or_default();
            return Err(BuildError::TypeMismatchInRole {
                label: p.left_label.clone(),
                role,
                expected: l.clone(),
                found: r.clone(),
            });
        }
    }
    Ok(())
}

fn walk_chain(
    label: &str,
    start_type: &str,
    roles: &[String],
    schema: &dyn Schema,
) -> Option<Result<String, BuildError>> {
    if roles.is_empty() {
        return Some(Ok(start_type.to_string()));
    }
    let mut current = start_type.to_string();
    for role in roles {
        match schema.role_target(&current, role) {
            Some(next) => current = next,
            None => {
                return Some(Err(BuildError::TypeMismatchInRole {
                    label: label.to_string(),
                    role: role.clone(),
                    expected: "a declared predecessor role".to_string(),
                    found: format!("no role `{role}` on `{current}`"),
                }))
            }
        }
    }
    Some(Ok(current))
}

/// Nested sub-specifications (projection-position specs) carry their own
/// given/match/projection structure but are validated *in* this
/// specification's scope, not independently: `spec`'s own labels and types
/// are folded into the outer context handed down, so a nested match may
/// reference a label this specification binds (spec §3, §4.E).
fn check_nested_specifications(
    spec: &Specification,
    schema: &dyn Schema,
    outer_visible: &[Label],
    outer_types: &BTreeMap<Label, TypeName>,
) -> Result<(), BuildError> {
    let mut visible = outer_visible.to_vec();
    visible.extend(spec_labels(spec));
    let mut types = outer_types.clone();
    types.extend(spec_types(spec));
    check_projection_nested(&spec.projection, schema, &visible, &types)
}

fn check_projection_nested(
    projection: &Projection,
    schema: &dyn Schema,
    visible: &[Label],
    types: &BTreeMap<Label, TypeName>,
) -> Result<(), BuildError> {
    match projection {
        Projection::Specification(nested) => validate_scoped(nested, schema, visible, types),
        Projection::Composite(entries) => {
            for (_, p) in entries {
                check_projection_nested(p, schema, visible, types)?;
            }
            Ok(())
        }
        Projection::Label(_) | Projection::Field { .. } | Projection::FactTime(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::parser::parse;

    struct TestSchema;
    impl Schema for TestSchema {
        fn role_target(&self, fact_type: &str, role: &str) -> Option<String> {
            match (fact_type, role) {
                ("Office.Closed", "office") => Some("Office".to_string()),
                ("Office", "company") => Some("Company".to_string()),
                ("Manager", "office") => Some("Office".to_string()),
                _ => None,
            }
        }
    }

    #[test]
    fn accepts_connected_spec() {
        let spec =
            parse("(office: Office) { cl: Office.Closed [ cl->office = office ] } => office")
                .unwrap();
        assert!(validate(&spec, &TestSchema).is_ok());
    }

    #[test]
    fn rejects_disconnected_spec() {
        let spec = parse("(a: Office, b: Office) { } => a").unwrap();
        let err = validate(&spec, &TestSchema).unwrap_err();
        assert!(matches!(err, BuildError::DisconnectedSpecification(_)));
    }

    #[test]
    fn rejects_forward_reference_on_given() {
        let spec = parse("(a: Office [ a = b ], b: Office) { } => a");
        // a's condition illegally references b, which is declared later.
        let spec = spec.unwrap();
        let err = validate(&spec, &TestSchema).unwrap_err();
        assert!(matches!(err, BuildError::ForwardGivenReference { .. }));
    }

    #[test]
    fn rejects_type_mismatch_in_role() {
        let spec = parse(
            "(company: Company) { o: Manager [ o->office = company ] } => o",
        )
        .unwrap();
        let err = validate(&spec, &TestSchema).unwrap_err();
        assert!(matches!(err, BuildError::TypeMismatchInRole { .. }));
    }

    /// Spec §8 scenario 3's literal specification: the nested `managers`
    /// collection's given `m` references `o`, which is bound only by the
    /// enclosing specification's match. This must validate — a nested
    /// projection spec runs with the outer tuple as extended givens (spec
    /// §4.E), so referencing an outer label is not a forward reference.
    #[test]
    fn accepts_nested_projection_referencing_outer_label() {
        let spec = parse(
            "(company: Company) { o: Office [ o->company = company ] } => { identifier = o.identifier, managers = (m: Manager [ m->office = o ]) { } => m.employeeNumber }",
        )
        .unwrap();
        assert!(validate(&spec, &TestSchema).is_ok());
    }
}
