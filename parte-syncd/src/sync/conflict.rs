#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionCheck {
    Apply,
    Reject { local: i64, remote: i64 },
}

/// Compares the revision captured when the local edit was made against the
/// one the remote holds now. Either side being unversioned lets the write
/// through.
pub fn check_revision(captured: Option<i64>, remote: Option<i64>) -> RevisionCheck {
    match (captured, remote) {
        (Some(local), Some(remote)) if remote > local => RevisionCheck::Reject { local, remote },
        _ => RevisionCheck::Apply,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_remote_revision_is_rejected() {
        assert_eq!(
            check_revision(Some(5), Some(6)),
            RevisionCheck::Reject {
                local: 5,
                remote: 6
            }
        );
    }

    #[test]
    fn matching_revision_applies() {
        assert_eq!(check_revision(Some(6), Some(6)), RevisionCheck::Apply);
    }

    #[test]
    fn older_remote_revision_applies() {
        assert_eq!(check_revision(Some(7), Some(6)), RevisionCheck::Apply);
    }

    #[test]
    fn unversioned_sides_apply() {
        assert_eq!(check_revision(None, Some(3)), RevisionCheck::Apply);
        assert_eq!(check_revision(Some(3), None), RevisionCheck::Apply);
    }
}
