use std::time::Duration;

use anyhow::{bail, Context};
use serde::Serialize;

use zonehvac_common::{Address, Role};

/// Bench device setup, read from `PERIPHERAL_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub role: Role,
    pub sync_held: bool,
    pub drift: Option<Drift>,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let number = |key: &str, default: i32| -> anyhow::Result<i32> {
            match get(key) {
                Some(raw) => raw
                    .trim()
                    .parse::<i32>()
                    .with_context(|| format!("{key} must be a whole number, got {raw:?}")),
                None => Ok(default),
            }
        };

        let role = match get("PERIPHERAL_ROLE")
            .unwrap_or_else(|| "thermostat".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "thermostat" => Role::Thermostat {
                current: number("PERIPHERAL_TEMP", 66)?,
                set: number("PERIPHERAL_SET_TEMP", 70)?,
                humidity: number("PERIPHERAL_HUMIDITY", 45)?,
            },
            "register" => Role::Register { flow: 0 },
            other => bail!("unknown PERIPHERAL_ROLE {other:?}, use 'thermostat' or 'register'"),
        };

        let sync_held = matches!(
            get("PERIPHERAL_SYNC").as_deref().map(str::trim),
            Some("1") | Some("true") | Some("on")
        );

        let drift = match get("PERIPHERAL_AMBIENT") {
            Some(_) if matches!(role, Role::Register { .. }) => None,
            Some(_) => Some(Drift {
                ambient: number("PERIPHERAL_AMBIENT", 0)?,
                period: Duration::from_secs(
                    u64::try_from(number("PERIPHERAL_DRIFT_SECS", 30)?.max(1)).unwrap_or(30),
                ),
            }),
            None => None,
        };

        Ok(Self {
            role,
            sync_held,
            drift,
        })
    }
}

/// Room air leaking toward the outside: the reading moves one degree toward
/// `ambient` every `period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Drift {
    pub ambient: i32,
    pub period: Duration,
}

impl Drift {
    pub fn apply(&self, role: &mut Role) {
        if let Role::Thermostat { current, .. } = role {
            *current += (self.ambient - *current).signum();
        }
    }
}

/// What the device publishes about itself once joined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeripheralState {
    pub address: Address,
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_temp: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_temp: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_percent: Option<i32>,
}

impl PeripheralState {
    pub fn new(address: Address, role: Role) -> Self {
        let mut state = Self {
            address,
            kind: role.kind().as_str(),
            current_temp: None,
            set_temp: None,
            humidity: None,
            flow_percent: None,
        };
        match role {
            Role::Thermostat {
                current,
                set,
                humidity,
            } => {
                state.current_temp = Some(current);
                state.set_temp = Some(set);
                state.humidity = Some(humidity);
            }
            Role::Register { flow } => state.flow_percent = Some(flow),
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults_to_a_thermostat_with_sync_released() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();

        assert_eq!(
            settings.role,
            Role::Thermostat {
                current: 66,
                set: 70,
                humidity: 45
            }
        );
        assert!(!settings.sync_held);
        assert_eq!(settings.drift, None);
    }

    #[test]
    fn register_ignores_ambient() {
        let settings = Settings::from_lookup(lookup(&[
            ("PERIPHERAL_ROLE", "Register"),
            ("PERIPHERAL_AMBIENT", "50"),
            ("PERIPHERAL_SYNC", "on"),
        ]))
        .unwrap();

        assert_eq!(settings.role, Role::Register { flow: 0 });
        assert!(settings.sync_held);
        assert_eq!(settings.drift, None);
    }

    #[test]
    fn rejects_unknown_roles_and_bad_numbers() {
        assert!(Settings::from_lookup(lookup(&[("PERIPHERAL_ROLE", "damper")])).is_err());
        assert!(Settings::from_lookup(lookup(&[("PERIPHERAL_SET_TEMP", "warm")])).is_err());
    }

    #[test]
    fn drift_creeps_toward_ambient_and_stops() {
        let drift = Drift {
            ambient: 64,
            period: Duration::from_secs(1),
        };
        let mut role = Role::Thermostat {
            current: 66,
            set: 70,
            humidity: 40,
        };

        for _ in 0..3 {
            drift.apply(&mut role);
        }

        assert!(matches!(role, Role::Thermostat { current: 64, .. }));
    }

    #[test]
    fn state_carries_only_the_role_fields() {
        let json = serde_json::to_value(PeripheralState::new(
            Address(0x03),
            Role::Register { flow: 60 },
        ))
        .unwrap();

        assert_eq!(json["kind"], "register");
        assert_eq!(json["flowPercent"], 60);
        assert!(json.get("setTemp").is_none());
    }
}
