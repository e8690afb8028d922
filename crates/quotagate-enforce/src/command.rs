//! Desired states and the device commands that realise them.

use quotagate_policy::{DeviceId, RateLimit, SubscriberId, TrafficClass};
use serde::{Deserialize, Serialize};

use crate::device::{Device, NasClient, QueueParams};
use crate::error::Result;

/// Queueing discipline for a rate limit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    /// One queue per subscriber.
    #[default]
    Simple,
    /// Shared per-connection-queue across subscribers.
    Pcq,
}

/// Identifies one enforcement slot: a subscriber's traffic class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TargetKey {
    /// Subscriber.
    pub subscriber: SubscriberId,
    /// Traffic class.
    pub class: TrafficClass,
}

/// What a subscriber's traffic class should look like on its device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    /// Subscriber.
    pub subscriber: SubscriberId,
    /// Login name; names the device-side queue.
    pub username: String,
    /// Device serving the subscriber.
    pub device: DeviceId,
    /// Traffic class.
    pub class: TrafficClass,
    /// Effective speed.
    pub rate: RateLimit,
    /// Queueing discipline.
    pub queue: QueueKind,
    /// Most recent live session for the class, if known.
    pub session_id: Option<String>,
}

impl DesiredState {
    /// The slot this state occupies.
    pub fn target(&self) -> TargetKey {
        TargetKey {
            subscriber: self.subscriber,
            class: self.class,
        }
    }

    /// Device-side queue name.
    pub fn queue_name(&self) -> String {
        format!("qg-{}-{}", self.username, self.class)
    }

    /// Same target and policy, whatever session carries it.
    pub fn same_policy(&self, other: &DesiredState) -> bool {
        self.target() == other.target()
            && self.username == other.username
            && self.device == other.device
            && self.rate == other.rate
            && self.queue == other.queue
    }
}

/// A RADIUS attribute for CoA.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoaAttribute {
    /// Attribute name.
    pub name: String,
    /// Attribute value.
    pub value: String,
}

impl CoaAttribute {
    /// Creates an attribute.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Parameters of an apply-rate-limit command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RateLimitCommand {
    /// Queue name on the device.
    pub target: String,
    /// Subscriber the queue belongs to.
    pub subscriber: SubscriberId,
    /// Traffic class the queue shapes.
    pub class: TrafficClass,
    /// Speed to set.
    pub rate: RateLimit,
    /// Queueing discipline.
    pub queue: QueueKind,
    /// Device-wide queue placement.
    pub params: QueueParams,
}

/// A command sent to a device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnforcementCommand {
    /// Set or update a shaping queue.
    ApplyRateLimit(RateLimitCommand),
    /// Update a live session in place.
    IssueCoa {
        /// Session to update.
        session_id: String,
        /// Attributes to set.
        attributes: Vec<CoaAttribute>,
    },
    /// Drop the session so re-authentication applies the new policy.
    Disconnect {
        /// Login name.
        username: String,
        /// Session to drop, if known.
        session_id: Option<String>,
    },
}

impl EnforcementCommand {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EnforcementCommand::ApplyRateLimit(_) => "apply_rate_limit",
            EnforcementCommand::IssueCoa { .. } => "issue_coa",
            EnforcementCommand::Disconnect { .. } => "disconnect",
        }
    }

    /// True when enforcing means kicking the session so it re-authenticates.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, EnforcementCommand::Disconnect { .. })
    }

    /// Sends the command through `client`.
    pub async fn execute(&self, client: &dyn NasClient, device: &Device) -> Result<()> {
        match self {
            EnforcementCommand::ApplyRateLimit(command) => {
                client.apply_rate_limit(device, command).await
            }
            EnforcementCommand::IssueCoa {
                session_id,
                attributes,
            } => client.issue_coa(device, session_id, attributes).await,
            EnforcementCommand::Disconnect {
                username,
                session_id,
            } => {
                client
                    .disconnect(device, username, session_id.as_deref())
                    .await
            }
        }
    }
}

/// Chooses the command that moves `device` to `state`.
///
/// CDN classes always get a queue; shared when asked. Internet traffic gets a
/// queue when the device has an API, otherwise a CoA on the live session, otherwise
/// a disconnect.
pub fn plan_command(device: &Device, state: &DesiredState) -> EnforcementCommand {
    let queue = || {
        EnforcementCommand::ApplyRateLimit(RateLimitCommand {
            target: state.queue_name(),
            subscriber: state.subscriber,
            class: state.class,
            rate: state.rate,
            queue: state.queue,
            params: device.queue_params.clone(),
        })
    };

    match state.class {
        TrafficClass::Cdn(_) => queue(),
        TrafficClass::Internet if device.api_enabled => queue(),
        TrafficClass::Internet => match (&state.session_id, device.supports_coa) {
            (Some(session_id), true) => EnforcementCommand::IssueCoa {
                session_id: session_id.clone(),
                attributes: device.vendor.rate_attributes(state.rate),
            },
            (session_id, _) => EnforcementCommand::Disconnect {
                username: state.username.clone(),
                session_id: session_id.clone(),
            },
        },
    }
}
