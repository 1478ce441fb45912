//! PatchEngine - applies patch batches to the UI document.
//!
//! Every patch is validated against the working copy as it stands after the
//! earlier patches of the same batch. A rejected patch is recorded and
//! skipped; the batch always runs to completion and the input document is
//! never touched.

use shared_types::{
    Component, Patch, PatchBatch, PatchError, PatchErrorKind, PatchOp, PatchRejection, UiDocument,
};

use super::validator::{PatchLimits, PatchValidator};

/// Result of applying one batch.
#[derive(Debug, Clone)]
pub struct PatchOutcome {
    pub document: UiDocument,
    pub errors: Vec<PatchError>,
    pub applied: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PatchEngine {
    validator: PatchValidator,
}

impl PatchEngine {
    pub fn new(limits: PatchLimits) -> Self {
        Self {
            validator: PatchValidator::new(limits),
        }
    }

    pub fn limits(&self) -> &PatchLimits {
        self.validator.limits()
    }

    pub fn apply(&self, document: &UiDocument, batch: &PatchBatch) -> PatchOutcome {
        let mut children = document.children.clone();
        let mut errors = Vec::new();
        let mut applied = 0;

        for (patch_index, raw) in batch.patches.iter().enumerate() {
            let result = self
                .validator
                .validate(children.len(), raw)
                .and_then(|patch| self.apply_one(&mut children, patch));
            match result {
                Ok(()) => applied += 1,
                Err(error) => {
                    tracing::debug!(
                        request_id = %batch.request_id,
                        patch_index,
                        kind = %error.kind,
                        "Patch rejected: {}",
                        error.message
                    );
                    errors.push(PatchError { patch_index, error });
                }
            }
        }

        let request_id = if batch.request_id.is_empty() {
            document.request_id.clone()
        } else {
            Some(batch.request_id.clone())
        };

        PatchOutcome {
            document: document.successor(children, request_id),
            errors,
            applied,
        }
    }

    /// Applies a validated patch. Checks run before the mutation, so a
    /// rejected patch leaves `children` untouched.
    fn apply_one(&self, children: &mut Vec<Component>, patch: Patch) -> Result<(), PatchRejection> {
        let id = patch.value.id().to_string();
        match (patch.op, patch.index) {
            (PatchOp::Append, _) => {
                let max = self.validator.limits().max_children;
                if children.len() >= max {
                    return Err(PatchRejection::new(
                        PatchErrorKind::DocumentFull,
                        format!("document already holds the maximum of {max} children"),
                    ));
                }
                if children.iter().any(|c| c.id() == id) {
                    return Err(duplicate(&id));
                }
                children.push(patch.value);
            }
            (PatchOp::Set, Some(index)) => {
                if index >= children.len() {
                    return Err(PatchRejection::new(
                        PatchErrorKind::IndexOutOfRange,
                        format!("index {index} is out of range for {} children", children.len()),
                    ));
                }
                if children
                    .iter()
                    .enumerate()
                    .any(|(i, c)| i != index && c.id() == id)
                {
                    return Err(duplicate(&id));
                }
                children[index] = patch.value;
            }
            (PatchOp::Set, None) => {
                return Err(PatchRejection::new(
                    PatchErrorKind::IndexOutOfRange,
                    "set requires an index",
                ));
            }
        }
        Ok(())
    }
}

fn duplicate(id: &str) -> PatchRejection {
    PatchRejection::new(
        PatchErrorKind::DuplicateId,
        format!("component id '{id}' is already used by another child"),
    )
}
