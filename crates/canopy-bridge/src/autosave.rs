//! ---
//! canopy_section: "03-telemetry-bridge"
//! canopy_subsection: "module"
//! canopy_type: "source"
//! canopy_scope: "code"
//! canopy_description: "Debounced, checksum-verified settings persistence."
//! canopy_version: "v0.0.0-prealpha"
//! canopy_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use canopy_msg::{SettingsFields, SettingsRequest};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::PersistenceError;
use crate::events::{BridgeEvent, EventBus};
use crate::metrics::BridgeMetrics;
use crate::rpc::BackendRpc;

#[derive(Default)]
struct SectionDraft {
    fields: SettingsFields,
    revision: u64,
    timer: Option<JoinHandle<()>>,
}

struct AutosaveInner {
    rpc: Arc<dyn BackendRpc>,
    debounce: Duration,
    drafts: Mutex<HashMap<String, SectionDraft>>,
    events: EventBus,
    metrics: Option<Arc<BridgeMetrics>>,
}

/// Buffers settings edits per section and persists each section once edits go
/// quiet for the debounce window.
///
/// A draft is cleared only after the backend confirms the save with a checksum.
/// Failed saves keep the draft and are not retried automatically; the next edit
/// or [`SettingsAutosave::close`] resubmits it.
#[derive(Clone)]
pub struct SettingsAutosave {
    inner: Arc<AutosaveInner>,
}

impl SettingsAutosave {
    /// Pipeline persisting through `rpc` after `debounce` of quiet.
    pub fn new(
        rpc: Arc<dyn BackendRpc>,
        debounce: Duration,
        events: EventBus,
        metrics: Option<Arc<BridgeMetrics>>,
    ) -> Self {
        Self {
            inner: Arc::new(AutosaveInner {
                rpc,
                debounce,
                drafts: Mutex::new(HashMap::new()),
                events,
                metrics,
            }),
        }
    }

    /// Record an edit and restart the section's debounce window.
    pub fn edit(&self, section: &str, field: &str, value: JsonValue) {
        let mut drafts = self.inner.drafts.lock();
        let draft = drafts.entry(section.to_owned()).or_default();
        draft.fields.insert(field.to_owned(), value);
        draft.revision += 1;
        if let Some(pending) = draft.timer.take() {
            pending.abort();
        }

        let revision = draft.revision;
        let this = self.clone();
        let owned_section = section.to_owned();
        draft.timer = Some(tokio::spawn(async move {
            this.debounce_elapsed(owned_section, revision).await;
        }));
        debug!(section, field, revision, "settings draft updated");
    }

    async fn debounce_elapsed(self, section: String, revision: u64) {
        tokio::time::sleep(self.inner.debounce).await;
        {
            let mut drafts = self.inner.drafts.lock();
            match drafts.get_mut(&section) {
                // Detach from the draft so a later edit cannot abort the save in flight.
                Some(draft) if draft.revision == revision => draft.timer = None,
                _ => return,
            }
        }
        // Failures are logged and published by `flush`.
        let _ = self.flush(&section).await;
    }

    /// Persist the section's full draft now, cancelling its pending timer.
    ///
    /// Returns the verified checksum, or `None` when there was nothing to send.
    pub async fn flush(&self, section: &str) -> Result<Option<String>, PersistenceError> {
        let (fields, revision) = {
            let mut drafts = self.inner.drafts.lock();
            let Some(draft) = drafts.get_mut(section) else {
                return Ok(None);
            };
            if let Some(pending) = draft.timer.take() {
                pending.abort();
            }
            if draft.fields.is_empty() {
                return Ok(None);
            }
            (draft.fields.clone(), draft.revision)
        };

        let request = SettingsRequest {
            section: section.to_owned(),
            settings: fields,
        };
        info!(section, fields = request.settings.len(), "persisting settings");

        let outcome = match self.inner.rpc.save_settings(&request).await {
            Ok(response) => match response.verified_bcc() {
                Some(bcc) => Ok(bcc.to_owned()),
                None => Err(PersistenceError::Unverified {
                    section: section.to_owned(),
                    reason: response.error.clone().unwrap_or_else(|| {
                        format!("status '{}' without checksum", response.status)
                    }),
                }),
            },
            Err(source) => Err(PersistenceError::Rpc {
                section: section.to_owned(),
                source,
            }),
        };

        match outcome {
            Ok(bcc) => {
                {
                    let mut drafts = self.inner.drafts.lock();
                    if drafts
                        .get(section)
                        .is_some_and(|draft| draft.revision == revision)
                    {
                        drafts.remove(section);
                    }
                }
                info!(section, bcc = %bcc, "settings saved");
                if let Some(metrics) = &self.inner.metrics {
                    metrics.observe_settings_flushed();
                }
                self.inner.events.publish(BridgeEvent::SettingsSaved {
                    section: section.to_owned(),
                    bcc: bcc.clone(),
                });
                Ok(Some(bcc))
            }
            Err(err) => {
                warn!(section, error = %err, "settings save failed; draft retained");
                if let Some(metrics) = &self.inner.metrics {
                    metrics.observe_settings_failed();
                }
                self.inner.events.publish(BridgeEvent::SettingsFailed {
                    section: section.to_owned(),
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// The editing surface for `section` closed: save immediately.
    pub async fn close(&self, section: &str) -> Result<Option<String>, PersistenceError> {
        self.flush(section).await
    }

    /// Save every section that has a pending draft.
    pub async fn close_all(&self) -> Vec<(String, Result<Option<String>, PersistenceError>)> {
        let mut results = Vec::new();
        for section in self.pending_sections() {
            let result = self.flush(&section).await;
            results.push((section, result));
        }
        results
    }

    /// Unsaved fields of `section`.
    pub fn draft(&self, section: &str) -> Option<SettingsFields> {
        self.inner
            .drafts
            .lock()
            .get(section)
            .map(|draft| draft.fields.clone())
    }

    /// Sections with unsaved edits, sorted.
    pub fn pending_sections(&self) -> Vec<String> {
        let mut sections: Vec<String> = self
            .inner
            .drafts
            .lock()
            .iter()
            .filter(|(_, draft)| !draft.fields.is_empty())
            .map(|(section, _)| section.clone())
            .collect();
        sections.sort();
        sections
    }
}
