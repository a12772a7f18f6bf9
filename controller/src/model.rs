use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Programmer error: the row invariants were violated by domain code.
/// Never mapped to a bus response; callers let it abort the pass.
#[derive(Debug, thiserror::Error)]
#[error("updated_at {updated_at} precedes created_at {created_at}")]
pub struct DomainLogicError {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceStatus {
    Active,
    Inactive,
    Paused,
}

impl InstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Active => "ACTIVE",
            InstanceStatus::Inactive => "INACTIVE",
            InstanceStatus::Paused => "PAUSED",
        }
    }
}

impl FromStr for InstanceStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(InstanceStatus::Active),
            "INACTIVE" => Ok(InstanceStatus::Inactive),
            "PAUSED" => Ok(InstanceStatus::Paused),
            _ => Err(anyhow::anyhow!("unknown instance status: {s}")),
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The control-plane record for one device's worker lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub id: i64,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(
        id: i64,
        status: InstanceStatus,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Result<Self, DomainLogicError> {
        if updated_at < created_at {
            return Err(DomainLogicError {
                created_at,
                updated_at,
            });
        }
        Ok(Instance {
            id,
            status,
            created_at,
            updated_at,
        })
    }

    /// A fresh ACTIVE row for a first START.
    pub fn started(id: i64, now: DateTime<Utc>) -> Self {
        Instance {
            id,
            status: InstanceStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    /// The same row transitioned to `status`, stamped at `now`.
    pub fn with_status(
        &self,
        status: InstanceStatus,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainLogicError> {
        Instance::new(self.id, status, self.created_at, now)
    }
}

/// The canonical container name for a device; the only join key between
/// the store and the engine.
pub fn container_name(id: i64) -> String {
    format!("instance-{id}")
}

/// Inverse of [`container_name`]: accepts exactly `instance-<digits>`.
pub fn device_id_from_name(name: &str) -> Option<i64> {
    let digits = name.strip_prefix("instance-")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            InstanceStatus::Active,
            InstanceStatus::Inactive,
            InstanceStatus::Paused,
        ] {
            assert_eq!(status.as_str().parse::<InstanceStatus>().unwrap(), status);
        }
        assert!("RUNNING".parse::<InstanceStatus>().is_err());
    }

    #[test]
    fn rejects_updated_at_before_created_at() {
        let now = Utc::now();
        let earlier = now - Duration::seconds(1);
        assert!(Instance::new(1, InstanceStatus::Active, now, earlier).is_err());
        assert!(Instance::new(1, InstanceStatus::Active, now, now).is_ok());

        let instance = Instance::started(1, now);
        assert!(instance.with_status(InstanceStatus::Paused, earlier).is_err());
        let paused = instance.with_status(InstanceStatus::Paused, now).unwrap();
        assert_eq!(paused.status, InstanceStatus::Paused);
        assert_eq!(paused.created_at, now);
    }

    #[test]
    fn container_names_are_bijective() {
        assert_eq!(container_name(42), "instance-42");
        assert_eq!(device_id_from_name("instance-42"), Some(42));
        assert_eq!(device_id_from_name(&container_name(0)), Some(0));

        assert_eq!(device_id_from_name("instance-"), None);
        assert_eq!(device_id_from_name("instance-4x"), None);
        assert_eq!(device_id_from_name("instance-42-old"), None);
        assert_eq!(device_id_from_name("postgres"), None);
        assert_eq!(device_id_from_name("myinstance-42"), None);
    }
}
