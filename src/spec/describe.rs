//! Pretty-printer for [`Specification`] (spec §6).
//!
//! `parse(&describe(s)) == s` up to label alpha-renaming: `describe` never
//! invents or drops labels, so round-tripping a specification that was
//! itself produced by `parser::parse` is exact.

use std::fmt::Write as _;

use crate::spec::ast::{Condition, ExistentialCondition, LabeledGiven, Match, PathCondition, Projection, Specification};

pub fn describe(spec: &Specification) -> String {
    let mut out = String::new();
    write_specification(&mut out, spec);
    out
}

fn write_specification(out: &mut String, spec: &Specification) {
    out.push('(');
    for (i, given) in spec.given.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_given(out, given);
    }
    out.push_str(") {");
    for m in &spec.matches {
        out.push(' ');
        write_match(out, m);
    }
    out.push_str(" }");

    if spec.projection != Projection::Composite(Vec::new()) {
        out.push_str(" => ");
        write_projection(out, &spec.projection);
    }
}

fn write_given(out: &mut String, given: &LabeledGiven) {
    let _ = write!(out, "{}: {}", given.label, given.fact_type);
    write_conditions(out, &given.conditions);
}

fn write_match(out: &mut String, m: &Match) {
    let _ = write!(out, "{}: {}", m.unknown, m.fact_type);
    write_conditions(out, &m.conditions);
}

fn write_conditions(out: &mut String, conditions: &[Condition]) {
    if conditions.is_empty() {
        return;
    }
    out.push_str(" [");
    for (i, c) in conditions.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        } else {
            out.push(' ');
        }
        write_condition(out, c);
    }
    out.push_str(" ]");
}

fn write_condition(out: &mut String, condition: &Condition) {
    match condition {
        Condition::Path(p) => write_path(out, p),
        Condition::Existential(e) => write_existential(out, e),
    }
}

fn write_path(out: &mut String, p: &PathCondition) {
    out.push_str(&p.left_label);
    write_role_chain(out, &p.left_roles);
    out.push_str(" = ");
    out.push_str(&p.right_label);
    write_role_chain(out, &p.right_roles);
}

fn write_role_chain(out: &mut String, roles: &[String]) {
    if roles.is_empty() {
        return;
    }
    out.push_str("->");
    out.push_str(&roles.join("."));
}

fn write_existential(out: &mut String, e: &ExistentialCondition) {
    if !e.exists {
        out.push('!');
    }
    out.push_str("E {");
    for m in &e.matches {
        out.push(' ');
        write_match(out, m);
    }
    out.push_str(" }");
}

fn write_projection(out: &mut String, projection: &Projection) {
    match projection {
        Projection::Label(label) => out.push_str(label),
        Projection::Field { label, field } => {
            let _ = write!(out, "{label}.{field}");
        }
        Projection::FactTime(label) => {
            let _ = write!(out, "@{label}");
        }
        Projection::Specification(spec) => write_specification(out, spec),
        Projection::Composite(entries) => {
            out.push_str("{ ");
            for (i, (name, proj)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "{name} = ");
                write_projection(out, proj);
            }
            out.push_str(" }");
        }
    }
}
