//! ---
//! canopy_section: "03-telemetry-bridge"
//! canopy_subsection: "module"
//! canopy_type: "source"
//! canopy_scope: "code"
//! canopy_description: "Actuator override arbitration against autonomous telemetry."
//! canopy_version: "v0.0.0-prealpha"
//! canopy_owner: "tbd"
//! ---
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use canopy_msg::ActuatorValue;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// Who currently drives an actuator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActuatorMode {
    /// Telemetry from the autonomous controller is authoritative.
    Auto,
    /// The operator's value is authoritative until cleared.
    Override,
}

/// Arbitrated view of one actuator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Actuator {
    /// Unique actuator name.
    pub name: String,
    /// Current authority.
    pub mode: ActuatorMode,
    /// Value to display: the override while overridden, telemetry otherwise.
    pub value: ActuatorValue,
    /// Latest telemetry reading, kept even while overridden.
    pub telemetry: Option<ActuatorValue>,
    /// Last change to `value` or `mode`.
    pub last_updated: DateTime<Utc>,
    /// Arrival of the latest telemetry reading.
    pub telemetry_seen: Option<DateTime<Utc>>,
}

impl Actuator {
    /// Whether the operator currently holds this actuator.
    pub fn is_overridden(&self) -> bool {
        self.mode == ActuatorMode::Override
    }
}

/// Effect of a telemetry reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryOutcome {
    /// Reading became the displayed value.
    Applied,
    /// Actuator is overridden; reading kept as shadow only.
    Shadowed,
}

/// Effect of an operator override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OverrideConfirmation {
    /// Actuator newly entered override; show the lock indicator.
    Engaged,
    /// Actuator was already overridden; only the value changed.
    Updated,
}

/// Per-actuator override state, reconciled against incoming telemetry.
///
/// While an actuator is in [`ActuatorMode::Override`], telemetry never replaces
/// its displayed value. Only [`ActuatorRegistry::clear_override`] or
/// [`ActuatorRegistry::clear_all`] hand control back.
#[derive(Debug, Default)]
pub struct ActuatorRegistry {
    actuators: RwLock<BTreeMap<String, Actuator>>,
}

impl ActuatorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile a telemetry reading for `name`.
    pub fn apply_telemetry(&self, name: &str, value: ActuatorValue) -> TelemetryOutcome {
        let now = Utc::now();
        let mut actuators = self.actuators.write();
        let actuator = match actuators.entry(name.to_owned()) {
            Entry::Vacant(slot) => {
                slot.insert(Actuator {
                    name: name.to_owned(),
                    mode: ActuatorMode::Auto,
                    value,
                    telemetry: Some(value),
                    last_updated: now,
                    telemetry_seen: Some(now),
                });
                return TelemetryOutcome::Applied;
            }
            Entry::Occupied(slot) => slot.into_mut(),
        };

        actuator.telemetry = Some(value);
        actuator.telemetry_seen = Some(now);
        match actuator.mode {
            ActuatorMode::Override => TelemetryOutcome::Shadowed,
            ActuatorMode::Auto => {
                actuator.value = value;
                actuator.last_updated = now;
                TelemetryOutcome::Applied
            }
        }
    }

    /// Force `name` to `value` and hold it there.
    pub fn set_override(&self, name: &str, value: ActuatorValue) -> OverrideConfirmation {
        let now = Utc::now();
        let mut actuators = self.actuators.write();
        let actuator = actuators
            .entry(name.to_owned())
            .or_insert_with(|| Actuator {
                name: name.to_owned(),
                mode: ActuatorMode::Auto,
                value,
                telemetry: None,
                last_updated: now,
                telemetry_seen: None,
            });
        let confirmation = match actuator.mode {
            ActuatorMode::Auto => OverrideConfirmation::Engaged,
            ActuatorMode::Override => OverrideConfirmation::Updated,
        };
        actuator.mode = ActuatorMode::Override;
        actuator.value = value;
        actuator.last_updated = now;
        confirmation
    }

    /// Value a toggle of `name` would force. Unknown actuators count as off.
    pub fn toggled_value(&self, name: &str) -> ActuatorValue {
        let current = self
            .actuators
            .read()
            .get(name)
            .map(|actuator| actuator.value.is_on())
            .unwrap_or(false);
        ActuatorValue::Bool(!current)
    }

    /// Invert `name` under override. Returns the forced value.
    pub fn toggle(&self, name: &str) -> (ActuatorValue, OverrideConfirmation) {
        let mut actuators = self.actuators.write();
        let now = Utc::now();
        let actuator = actuators
            .entry(name.to_owned())
            .or_insert_with(|| Actuator {
                name: name.to_owned(),
                mode: ActuatorMode::Auto,
                value: ActuatorValue::Bool(false),
                telemetry: None,
                last_updated: now,
                telemetry_seen: None,
            });
        let next = ActuatorValue::Bool(!actuator.value.is_on());
        let confirmation = match actuator.mode {
            ActuatorMode::Auto => OverrideConfirmation::Engaged,
            ActuatorMode::Override => OverrideConfirmation::Updated,
        };
        actuator.mode = ActuatorMode::Override;
        actuator.value = next;
        actuator.last_updated = now;
        (next, confirmation)
    }

    /// Hand `name` back to telemetry. The displayed value falls back to the
    /// latest shadow reading. Returns whether an override was active.
    pub fn clear_override(&self, name: &str) -> bool {
        let mut actuators = self.actuators.write();
        match actuators.get_mut(name) {
            Some(actuator) if actuator.is_overridden() => {
                release(actuator, Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Hand every actuator back to telemetry in one step. Returns the released names.
    pub fn clear_all(&self) -> Vec<String> {
        let now = Utc::now();
        let mut actuators = self.actuators.write();
        actuators
            .values_mut()
            .filter(|actuator| actuator.is_overridden())
            .map(|actuator| {
                release(actuator, now);
                actuator.name.clone()
            })
            .collect()
    }

    /// Snapshot of one actuator.
    pub fn get(&self, name: &str) -> Option<Actuator> {
        self.actuators.read().get(name).cloned()
    }

    /// Displayed value of one actuator.
    pub fn value(&self, name: &str) -> Option<ActuatorValue> {
        self.actuators.read().get(name).map(|actuator| actuator.value)
    }

    /// All actuators, sorted by name.
    pub fn snapshot(&self) -> Vec<Actuator> {
        self.actuators.read().values().cloned().collect()
    }

    /// Names of actuators under override, sorted.
    pub fn overridden(&self) -> Vec<String> {
        self.actuators
            .read()
            .values()
            .filter(|actuator| actuator.is_overridden())
            .map(|actuator| actuator.name.clone())
            .collect()
    }

    /// Number of known actuators.
    pub fn len(&self) -> usize {
        self.actuators.read().len()
    }

    /// Whether no actuator has been seen yet.
    pub fn is_empty(&self) -> bool {
        self.actuators.read().is_empty()
    }
}

fn release(actuator: &mut Actuator, now: DateTime<Utc>) {
    actuator.mode = ActuatorMode::Auto;
    if let Some(reading) = actuator.telemetry {
        actuator.value = reading;
    }
    actuator.last_updated = now;
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    const PUMP: &str = "pump_active";

    #[test]
    fn override_survives_contradicting_telemetry() {
        let registry = ActuatorRegistry::new();
        assert_eq!(
            registry.set_override(PUMP, ActuatorValue::Bool(true)),
            OverrideConfirmation::Engaged
        );
        for _ in 0..5 {
            assert_eq!(
                registry.apply_telemetry(PUMP, ActuatorValue::Bool(false)),
                TelemetryOutcome::Shadowed
            );
        }
        let pump = registry.get(PUMP).unwrap();
        assert_eq!(pump.value, ActuatorValue::Bool(true));
        assert_eq!(pump.mode, ActuatorMode::Override);
        assert_eq!(pump.telemetry, Some(ActuatorValue::Bool(false)));
    }

    #[test]
    fn clear_then_telemetry_drives_value() {
        let registry = ActuatorRegistry::new();
        registry.set_override("lights", ActuatorValue::Bool(true));
        assert!(registry.clear_override("lights"));
        assert_eq!(
            registry.apply_telemetry("lights", ActuatorValue::Bool(false)),
            TelemetryOutcome::Applied
        );
        assert_eq!(registry.value("lights"), Some(ActuatorValue::Bool(false)));
    }

    #[test]
    fn clear_restores_shadow_reading() {
        let registry = ActuatorRegistry::new();
        registry.apply_telemetry("nutrient_a", ActuatorValue::Number(0.2));
        registry.set_override("nutrient_a", ActuatorValue::Number(0.9));
        registry.apply_telemetry("nutrient_a", ActuatorValue::Number(0.3));
        assert!(registry.clear_override("nutrient_a"));
        assert_eq!(
            registry.value("nutrient_a"),
            Some(ActuatorValue::Number(0.3))
        );
        assert!(!registry.clear_override("nutrient_a"));
    }

    #[test]
    fn repeated_override_reports_update() {
        let registry = ActuatorRegistry::new();
        registry.set_override("water_pump", ActuatorValue::Bool(true));
        assert_eq!(
            registry.set_override("water_pump", ActuatorValue::Bool(false)),
            OverrideConfirmation::Updated
        );
    }

    #[test]
    fn toggle_of_unknown_actuator_turns_it_on() {
        let registry = ActuatorRegistry::new();
        assert_eq!(registry.toggled_value("ph_down_pump"), ActuatorValue::Bool(true));
        let (value, confirmation) = registry.toggle("ph_down_pump");
        assert_eq!(value, ActuatorValue::Bool(true));
        assert_eq!(confirmation, OverrideConfirmation::Engaged);
        let (value, confirmation) = registry.toggle("ph_down_pump");
        assert_eq!(value, ActuatorValue::Bool(false));
        assert_eq!(confirmation, OverrideConfirmation::Updated);
    }

    #[test]
    fn toggle_treats_nonzero_level_as_on() {
        let registry = ActuatorRegistry::new();
        registry.apply_telemetry("nutrient_b", ActuatorValue::Number(0.5));
        assert_eq!(
            registry.toggled_value("nutrient_b"),
            ActuatorValue::Bool(false)
        );
    }

    #[test]
    fn clear_all_releases_every_override() {
        let registry = ActuatorRegistry::new();
        registry.set_override("water_pump", ActuatorValue::Bool(true));
        registry.set_override("lights", ActuatorValue::Bool(false));
        registry.apply_telemetry("nutrient_a", ActuatorValue::Number(0.1));

        let released = registry.clear_all();
        assert_eq!(released, vec!["lights".to_owned(), "water_pump".to_owned()]);
        assert!(registry.overridden().is_empty());
        assert!(registry
            .snapshot()
            .iter()
            .all(|actuator| actuator.mode == ActuatorMode::Auto));
    }

    #[test]
    fn concurrent_readers_never_observe_partial_clear_all() {
        let registry = Arc::new(ActuatorRegistry::new());
        let names: Vec<String> = (0..32).map(|i| format!("doser_{i:02}")).collect();
        for name in &names {
            registry.set_override(name, ActuatorValue::Bool(true));
        }

        let reader = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for _ in 0..1_000 {
                    let overridden = registry.overridden().len();
                    assert!(overridden == 32 || overridden == 0, "saw {overridden}");
                }
            })
        };
        registry.clear_all();
        reader.join().unwrap();
        assert!(registry.overridden().is_empty());
    }
}
