use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// The 7-state lifecycle of an externally-driven operation (§3).
///
/// ```text
/// Default → Preparing → Doing ─┬─→ Completing ─┬─→ Done
///                              │               │
///                              └─→ Aborting ───┴─→ Error
///            Preparing ──────────────────────────→ Error  (prepare failure)
/// ```
///
/// `Done` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtStatus {
    Default = 0,
    Preparing = 1,
    Doing = 2,
    Done = 3,
    Completing = 4,
    Aborting = 5,
    Error = 6,
}

impl ExtStatus {
    /// `is_ready() ≡ status ∈ {Done, Error}` (§3).
    pub fn is_ready(self) -> bool {
        matches!(self, ExtStatus::Done | ExtStatus::Error)
    }

    /// Whether `self -> next` is a legal edge of the DAG in §3. The layer
    /// itself does not enforce this beyond type safety (§4.1) — handlers
    /// are responsible for only requesting legal transitions — but callers
    /// that want a belt-and-braces check (tests, debug assertions) can use
    /// this.
    pub fn can_transition_to(self, next: ExtStatus) -> bool {
        use ExtStatus::*;
        matches!(
            (self, next),
            (Default, Preparing)
                | (Preparing, Doing)
                | (Preparing, Error)
                | (Doing, Completing)
                | (Doing, Aborting)
                | (Completing, Done)
                | (Completing, Error)
                | (Aborting, Error)
        )
    }
}

/// One externally-driven operation tracked in persisted state (§3). Two
/// operations are "the same" iff `(kind, change_id)` match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalOperation {
    pub kind: String,
    pub change_id: String,
    pub status: ExtStatus,
    #[serde(default)]
    pub error_message: String,
    /// Opaque payload, typically JSON-encoded (§4.4 step 4: `CBOR/JSON of
    /// {payload, sealing_method}`). Use [`ExternalOperation::context_as`]
    /// and [`ExternalOperation::set_context`] rather than decoding by hand.
    #[serde(default)]
    pub context: Vec<u8>,
}

impl ExternalOperation {
    pub fn new(kind: impl Into<String>, change_id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            change_id: change_id.into(),
            status: ExtStatus::Default,
            error_message: String::new(),
            context: Vec::new(),
        }
    }

    /// Whether this operation is the one identified by `(kind, change_id)`.
    pub fn is(&self, kind: &str, change_id: &str) -> bool {
        self.kind == kind && self.change_id == change_id
    }

    pub fn set_context<T: Serialize>(&mut self, value: &T) -> serde_json::Result<()> {
        self.context = serde_json::to_vec(value)?;
        Ok(())
    }

    pub fn context_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_ready() {
        assert!(ExtStatus::Done.is_ready());
        assert!(ExtStatus::Error.is_ready());
        assert!(!ExtStatus::Doing.is_ready());
    }

    #[test]
    fn happy_path_transitions_are_legal() {
        assert!(ExtStatus::Default.can_transition_to(ExtStatus::Preparing));
        assert!(ExtStatus::Preparing.can_transition_to(ExtStatus::Doing));
        assert!(ExtStatus::Doing.can_transition_to(ExtStatus::Completing));
        assert!(ExtStatus::Completing.can_transition_to(ExtStatus::Done));
    }

    #[test]
    fn skipping_a_state_is_illegal() {
        assert!(!ExtStatus::Default.can_transition_to(ExtStatus::Doing));
        assert!(!ExtStatus::Doing.can_transition_to(ExtStatus::Done));
    }

    #[test]
    fn identity_is_kind_and_change_id_only() {
        let op = ExternalOperation::new("fde-efi-secureboot-db-update", "42");
        assert!(op.is("fde-efi-secureboot-db-update", "42"));
        assert!(!op.is("fde-efi-secureboot-db-update", "7"));
    }

    #[test]
    fn context_round_trips_as_json() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Ctx {
            payload: Vec<u8>,
            sealing_method: String,
        }
        let mut op = ExternalOperation::new("k", "1");
        let ctx = Ctx {
            payload: b"payload".to_vec(),
            sealing_method: "tpm2".into(),
        };
        op.set_context(&ctx).unwrap();
        assert_eq!(op.context_as::<Ctx>().unwrap(), ctx);
    }
}
