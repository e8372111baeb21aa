// Colony Memory — Access Policy
// Department → access level table plus one pure decision function over
// (caller, operation, target). Evaluated once per request; storage code
// never makes permission decisions of its own beyond the ownership guard
// on overwrite.

use crate::atoms::types::{Caller, ContentKind, InsightsSubject, ReadScope};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    /// Read own department + shared; may log history and outcomes.
    ReadOnly,
    /// Also writes knowledge for its own department.
    ReadWrite,
    /// Reads everything; writes unstructured knowledge for any department.
    Admin,
    /// The memory service itself. Unrestricted.
    System,
}

const DEPARTMENT_ACCESS: &[(&str, AccessLevel)] = &[
    ("memory", AccessLevel::System),
    ("executive", AccessLevel::Admin),
    ("engineering", AccessLevel::ReadWrite),
    ("finance", AccessLevel::ReadWrite),
    ("marketing", AccessLevel::ReadWrite),
    ("hr", AccessLevel::ReadWrite),
    ("research", AccessLevel::ReadWrite),
    ("sales", AccessLevel::ReadWrite),
    ("product", AccessLevel::ReadWrite),
    ("support", AccessLevel::ReadOnly),
];

/// Unknown departments get the least privilege.
pub fn access_level(department: &str) -> AccessLevel {
    let dept = department.trim();
    DEPARTMENT_ACCESS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(dept))
        .map(|(_, level)| *level)
        .unwrap_or(AccessLevel::ReadOnly)
}

pub fn read_scope(caller: &Caller) -> ReadScope {
    match access_level(&caller.department) {
        AccessLevel::Admin | AccessLevel::System => ReadScope::All,
        _ => ReadScope::Department(caller.department.to_lowercase()),
    }
}

/// What a request touches, as far as access control cares.
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    /// Knowledge write into `department`.
    KnowledgeWrite { department: &'a str, kind: ContentKind },
    /// Any knowledge read; visibility is enforced through the read scope.
    KnowledgeRead,
    /// Append to history / record an outcome on the caller's own behalf.
    OwnActivity,
    ThreadRead,
    CallerTimeline { caller_id: &'a str },
    Insights(&'a InsightsSubject),
    Registry { caller_id: &'a str, department: Option<&'a str> },
    Retire,
}

/// `Err(reason)` when denied. Reasons are safe to return to the caller.
pub fn authorize(caller: &Caller, target: Target<'_>) -> Result<(), String> {
    let level = access_level(&caller.department);
    let privileged = level >= AccessLevel::Admin;
    let own_department = |dept: &str| dept.trim().eq_ignore_ascii_case(caller.department.trim());

    match target {
        Target::KnowledgeWrite { department, kind } => {
            if level == AccessLevel::ReadOnly {
                return Err(format!("department '{}' has read-only access", caller.department));
            }
            if own_department(department) || level == AccessLevel::System {
                return Ok(());
            }
            match (kind, level) {
                (ContentKind::Structured, _) => Err(format!(
                    "only the '{}' department may write authoritative entries it owns",
                    department
                )),
                (ContentKind::Unstructured, AccessLevel::Admin) => Ok(()),
                _ => Err(format!(
                    "department '{}' cannot write entries owned by '{}'",
                    caller.department, department
                )),
            }
        }
        Target::KnowledgeRead | Target::OwnActivity | Target::ThreadRead => Ok(()),
        Target::CallerTimeline { caller_id } => {
            if caller_id == caller.id || privileged {
                Ok(())
            } else {
                Err("cannot read another caller's history".into())
            }
        }
        Target::Insights(InsightsSubject::Caller(id)) => {
            if *id == caller.id || privileged {
                Ok(())
            } else {
                Err("cannot read another caller's insights".into())
            }
        }
        Target::Insights(InsightsSubject::Category(_)) => Ok(()),
        Target::Registry { caller_id, department } => {
            let self_registration =
                caller_id == caller.id && department.map(own_department).unwrap_or(true);
            if self_registration || privileged {
                Ok(())
            } else {
                Err("only admin departments may register other callers".into())
            }
        }
        Target::Retire => {
            if privileged {
                Ok(())
            } else {
                Err("only admin departments may retire callers".into())
            }
        }
    }
}
