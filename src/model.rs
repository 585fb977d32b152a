use thiserror::Error;

/// Hard upper bound on group membership. `setup.allocation.maxGroupSize`
/// may lower it but never raise it.
pub const MAX_GROUP_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Faculty,
    Student,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Self::Admin),
            "faculty" => Some(Self::Faculty),
            "student" => Some(Self::Student),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Faculty => "faculty",
            Self::Student => "student",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectStatus {
    Proposed,
    Approved,
    Rejected,
    InProgress,
    Completed,
}

impl ProjectStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PROPOSED" => Some(Self::Proposed),
            "APPROVED" => Some(Self::Approved),
            "REJECTED" => Some(Self::Rejected),
            "IN_PROGRESS" => Some(Self::InProgress),
            "COMPLETED" => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Proposed => "PROPOSED",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
        }
    }

    /// Projects in these states occupy a slot in their guide's workload.
    pub fn counts_toward_load(self) -> bool {
        !matches!(self, Self::Rejected | Self::Completed)
    }

    pub fn can_transition_to(self, next: ProjectStatus) -> bool {
        use ProjectStatus::*;
        matches!(
            (self, next),
            (Proposed, Approved)
                | (Proposed, Rejected)
                | (Rejected, Proposed)
                | (Approved, InProgress)
                | (InProgress, Completed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeetingStatus {
    Scheduled,
    Completed,
    Cancelled,
}

impl MeetingStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(Self::Scheduled),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RuleError {
    #[error("group is full ({current}/{limit} members)")]
    GroupFull { current: usize, limit: usize },
    #[error("faculty is at capacity ({active}/{capacity} active projects)")]
    FacultyAtCapacity { active: i64, capacity: i64 },
    #[error("cannot move project from {from} to {to}")]
    IllegalTransition { from: &'static str, to: &'static str },
    #[error("score must be between 0 and {max_score}")]
    ScoreOutOfRange { max_score: f64 },
    #[error("maxScore must be greater than 0")]
    BadMaxScore,
}

impl RuleError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::GroupFull { .. } | Self::FacultyAtCapacity { .. } => "capacity_exceeded",
            Self::IllegalTransition { .. } => "invalid_state",
            Self::ScoreOutOfRange { .. } | Self::BadMaxScore => "bad_params",
        }
    }
}

/// Effective group size limit: the configured value clamped to `1..=MAX_GROUP_SIZE`.
pub fn group_size_limit(configured: i64) -> usize {
    (configured.max(1) as usize).min(MAX_GROUP_SIZE)
}

pub fn check_group_capacity(current: usize, adding: usize, limit: usize) -> Result<(), RuleError> {
    if current + adding > limit {
        return Err(RuleError::GroupFull { current, limit });
    }
    Ok(())
}

/// `active` must already exclude the project being (re)assigned.
pub fn check_faculty_capacity(active: i64, capacity: i64) -> Result<(), RuleError> {
    if active >= capacity {
        return Err(RuleError::FacultyAtCapacity { active, capacity });
    }
    Ok(())
}

pub fn check_transition(from: ProjectStatus, to: ProjectStatus) -> Result<(), RuleError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(RuleError::IllegalTransition {
            from: from.as_str(),
            to: to.as_str(),
        })
    }
}

pub fn check_score(score: f64, max_score: f64) -> Result<(), RuleError> {
    if !max_score.is_finite() || max_score <= 0.0 {
        return Err(RuleError::BadMaxScore);
    }
    if !score.is_finite() || score < 0.0 || score > max_score {
        return Err(RuleError::ScoreOutOfRange { max_score });
    }
    Ok(())
}

pub fn round_1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

pub fn percent(part: f64, whole: f64) -> Option<f64> {
    if whole <= 0.0 {
        None
    } else {
        Some(round_1(100.0 * part / whole))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifth_member_is_rejected() {
        let limit = group_size_limit(4);
        assert!(check_group_capacity(3, 1, limit).is_ok());
        assert_eq!(
            check_group_capacity(4, 1, limit),
            Err(RuleError::GroupFull {
                current: 4,
                limit: 4
            })
        );
    }

    #[test]
    fn configured_group_size_never_exceeds_hard_cap() {
        assert_eq!(group_size_limit(10), 4);
        assert_eq!(group_size_limit(2), 2);
        assert_eq!(group_size_limit(0), 1);
    }

    #[test]
    fn faculty_capacity_rejects_at_limit() {
        assert!(check_faculty_capacity(3, 4).is_ok());
        let e = check_faculty_capacity(4, 4).unwrap_err();
        assert_eq!(e.code(), "capacity_exceeded");
    }

    #[test]
    fn project_lifecycle_transitions() {
        use ProjectStatus::*;
        assert!(check_transition(Proposed, Approved).is_ok());
        assert!(check_transition(Rejected, Proposed).is_ok());
        assert!(check_transition(Approved, InProgress).is_ok());
        assert!(check_transition(InProgress, Completed).is_ok());
        assert!(check_transition(Proposed, Completed).is_err());
        assert!(check_transition(Completed, InProgress).is_err());
        assert!(!Completed.counts_toward_load());
        assert!(InProgress.counts_toward_load());
    }

    #[test]
    fn status_parse_is_case_insensitive() {
        assert_eq!(ProjectStatus::parse("in_progress"), Some(ProjectStatus::InProgress));
        assert_eq!(Role::parse(" Faculty "), Some(Role::Faculty));
        assert_eq!(Role::parse("guest"), None);
    }

    #[test]
    fn score_bounds() {
        assert!(check_score(10.0, 10.0).is_ok());
        assert!(check_score(0.0, 10.0).is_ok());
        assert_eq!(check_score(1.0, 0.0), Err(RuleError::BadMaxScore));
        assert!(check_score(10.5, 10.0).is_err());
        assert!(check_score(-1.0, 10.0).is_err());
    }

    #[test]
    fn percent_rounds_to_one_decimal() {
        assert_eq!(percent(2.0, 3.0), Some(66.7));
        assert_eq!(percent(1.0, 0.0), None);
    }
}
