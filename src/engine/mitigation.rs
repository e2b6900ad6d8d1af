//! Recovery failure mitigation.
//!
//! When an entity fails to load, handlers of the load-failed event pick
//! a [`Mitigation`] and a [`RecoveryFailureMitigator`] applies it. A
//! strategy hook can bail out with [`MitigationOutcome::Retry`] to hand
//! over to another strategy; [`mitigate_with_fallback`] drives that
//! loop and never lets the bail-out escape.

use serde::Deserialize;
use serde::Serialize;

use crate::engine::entity::ReactiveEntityKind;
use crate::engine::entity::Uri;
use crate::errors::SharedError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mitigation {
    /// Leave the entity out for now; a later recovery retries it.
    #[default]
    Ignore,
    /// Drop the entity for good.
    Remove,
    /// Rebuild the entity from its definition, discarding state.
    Regenerate,
}

impl Mitigation {
    /// Strategy to try when this one is not handled.
    pub fn fallback(self) -> Option<Mitigation> {
        match self {
            Mitigation::Regenerate => Some(Mitigation::Remove),
            Mitigation::Ignore | Mitigation::Remove => None,
        }
    }
}

/// Why a strategy hook did not complete.
#[derive(Debug, Clone)]
pub enum MitigationOutcome {
    /// Abandon this strategy and try another.
    Retry(Mitigation),
    /// Give up on the entity with this error.
    Failed(SharedError),
}

/// The entity a mitigator is asked to deal with.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryFailure<'a> {
    pub uri: &'a Uri,
    pub kind: ReactiveEntityKind,
    pub error: &'a SharedError,
}

/// Applies mitigation strategies.
///
/// `Ok(true)` means the strategy took care of the entity, `Ok(false)`
/// that it did not. Only [`RecoveryFailureMitigator::ignore`] succeeds
/// by default.
pub trait RecoveryFailureMitigator {
    /// Called before every strategy hook.
    fn on_all(&mut self, _failure: &RecoveryFailure<'_>, _mitigation: Mitigation) {}

    fn ignore(&mut self, _failure: &RecoveryFailure<'_>) -> Result<bool, MitigationOutcome> {
        Ok(true)
    }

    fn remove(&mut self, _failure: &RecoveryFailure<'_>) -> Result<bool, MitigationOutcome> {
        Ok(false)
    }

    fn regenerate(&mut self, _failure: &RecoveryFailure<'_>) -> Result<bool, MitigationOutcome> {
        Ok(false)
    }

    fn mitigate(
        &mut self,
        failure: &RecoveryFailure<'_>,
        mitigation: Mitigation,
    ) -> Result<bool, MitigationOutcome> {
        self.on_all(failure, mitigation);
        match mitigation {
            Mitigation::Ignore => self.ignore(failure),
            Mitigation::Remove => self.remove(failure),
            Mitigation::Regenerate => self.regenerate(failure),
        }
    }
}

/// Mitigator with only the default behavior.
#[derive(Debug, Default)]
pub struct DefaultMitigator;

impl RecoveryFailureMitigator for DefaultMitigator {}

/// Apply `initial`, following bail-outs and fallbacks until a strategy
/// succeeds.
///
/// Returns the strategy that succeeded, or the error to surface when
/// none did. Each strategy is tried at most once.
pub fn mitigate_with_fallback(
    mitigator: &mut dyn RecoveryFailureMitigator,
    failure: &RecoveryFailure<'_>,
    initial: Mitigation,
) -> Result<Mitigation, SharedError> {
    let mut tried = Vec::new();
    let mut next = Some(initial);
    while let Some(mitigation) = next.take() {
        if tried.contains(&mitigation) {
            break;
        }
        tried.push(mitigation);
        match mitigator.mitigate(failure, mitigation) {
            Ok(true) => return Ok(mitigation),
            Ok(false) => next = mitigation.fallback(),
            Err(MitigationOutcome::Retry(other)) => {
                tracing::debug!(
                    "Mitigation {mitigation:?} for {} '{}' bailed out; trying {other:?}",
                    failure.kind,
                    failure.uri
                );
                next = Some(other);
            }
            Err(MitigationOutcome::Failed(err)) => return Err(err),
        }
    }
    Err(failure.error.clone())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_test::assert_tokens;
    use serde_test::Token;

    use super::*;
    use crate::errors::EngineError;

    fn failure_parts() -> (Uri, SharedError) {
        (
            Uri::new("qe://sub/broken"),
            Arc::new(EngineError::StateCorrupted("bad record".to_owned())),
        )
    }

    #[derive(Default)]
    struct Recording {
        seen: Vec<Mitigation>,
        regenerate_bails: bool,
        remove_works: bool,
    }

    impl RecoveryFailureMitigator for Recording {
        fn on_all(&mut self, _failure: &RecoveryFailure<'_>, mitigation: Mitigation) {
            self.seen.push(mitigation);
        }

        fn remove(&mut self, _failure: &RecoveryFailure<'_>) -> Result<bool, MitigationOutcome> {
            Ok(self.remove_works)
        }

        fn regenerate(&mut self, _failure: &RecoveryFailure<'_>) -> Result<bool, MitigationOutcome> {
            if self.regenerate_bails {
                Err(MitigationOutcome::Retry(Mitigation::Remove))
            } else {
                Ok(false)
            }
        }
    }

    #[test]
    fn ignore_always_succeeds() {
        let (uri, error) = failure_parts();
        let failure = RecoveryFailure {
            uri: &uri,
            kind: ReactiveEntityKind::Subscription,
            error: &error,
        };
        let mut mitigator = DefaultMitigator;
        assert!(matches!(
            mitigator.mitigate(&failure, Mitigation::Ignore),
            Ok(true)
        ));
        assert_eq!(
            mitigate_with_fallback(&mut mitigator, &failure, Mitigation::Ignore).unwrap(),
            Mitigation::Ignore
        );
    }

    #[test]
    fn base_remove_and_regenerate_are_unhandled() {
        let (uri, error) = failure_parts();
        let failure = RecoveryFailure {
            uri: &uri,
            kind: ReactiveEntityKind::Observable,
            error: &error,
        };
        let mut mitigator = DefaultMitigator;
        assert!(matches!(
            mitigator.mitigate(&failure, Mitigation::Remove),
            Ok(false)
        ));
        let err = mitigate_with_fallback(&mut mitigator, &failure, Mitigation::Regenerate)
            .unwrap_err();
        assert!(Arc::ptr_eq(&err, &error));
    }

    #[test]
    fn bail_out_hands_over_to_next_strategy() {
        let (uri, error) = failure_parts();
        let failure = RecoveryFailure {
            uri: &uri,
            kind: ReactiveEntityKind::Subscription,
            error: &error,
        };
        let mut mitigator = Recording {
            regenerate_bails: true,
            remove_works: true,
            ..Default::default()
        };
        let applied =
            mitigate_with_fallback(&mut mitigator, &failure, Mitigation::Regenerate).unwrap();
        assert_eq!(applied, Mitigation::Remove);
        assert_eq!(mitigator.seen, vec![Mitigation::Regenerate, Mitigation::Remove]);
    }

    #[test]
    fn strategies_are_not_retried() {
        let (uri, error) = failure_parts();
        let failure = RecoveryFailure {
            uri: &uri,
            kind: ReactiveEntityKind::Subscription,
            error: &error,
        };
        let mut mitigator = Recording {
            regenerate_bails: true,
            remove_works: false,
            ..Default::default()
        };
        assert!(mitigate_with_fallback(&mut mitigator, &failure, Mitigation::Regenerate).is_err());
        assert_eq!(mitigator.seen, vec![Mitigation::Regenerate, Mitigation::Remove]);
    }

    #[test]
    fn mitigation_serializes_snake_case() {
        assert_tokens(
            &Mitigation::Regenerate,
            &[Token::UnitVariant {
                name: "Mitigation",
                variant: "regenerate",
            }],
        );
    }
}
