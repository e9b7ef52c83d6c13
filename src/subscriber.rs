//! Subscription registry and the monitored-traffic dispatcher.
//!
//! The connection engine routes decoded frames that match no pending
//! exchange into two queues: monitored SAL and monitored MMI (CAL status
//! replies). A dedicated dispatch task drains both for the lifetime of the
//! connection and fans each event out to every registered subscription
//! whose filter matches. Registration and removal are safe to perform
//! concurrently with dispatch; the registry is a concurrent map.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::{
    value::{ResponseCode, Value},
    wire::{
        ApplicationId,
        CalData,
        CalReply,
        LightingData,
        MonitoredSal,
        SalData,
        StatusPayload,
        UnitAddress,
    },
};

/// Callback receiving matched events inside the dispatch task.
pub type EventConsumer = Arc<dyn Fn(SubscriptionEvent) + Send + Sync>;

/// What a subscription wants to see.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MonitorFilter {
    /// Monitored SAL traffic, optionally narrowed to a unit and application.
    Sal {
        unit: Option<UnitAddress>,
        application: Option<ApplicationId>,
    },
    /// Monitored MMI status, optionally narrowed to a unit and application.
    Mmi {
        unit: Option<UnitAddress>,
        application: Option<ApplicationId>,
    },
}

/// One delivered event.
#[derive(Clone, Debug, PartialEq)]
pub struct SubscriptionEvent {
    /// Name the subscription was registered under.
    pub name: String,
    /// Event address, e.g. `sal/lighting/on` or `status/binary/lighting`.
    pub address: String,
    /// Textual origin path, e.g. `u5` or `b2-b3-u5`.
    pub source: String,
    /// Always [`ResponseCode::Ok`] for monitored traffic.
    pub response_code: ResponseCode,
    /// Decoded payload.
    pub value: Value,
}

/// Handle returned by [`SubscriberRegistry::subscribe`]; pass it back to
/// [`SubscriberRegistry::unsubscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: u64,
}

struct Subscription {
    name: String,
    filter: MonitorFilter,
    consumer: EventConsumer,
}

/// Concurrent registry of subscriptions, shared between the driver API and
/// the dispatch task.
#[derive(Default)]
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    entries: DashMap<u64, Subscription>,
}

impl SubscriberRegistry {
    /// Register a consumer for monitored traffic matching `filter`.
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        filter: MonitorFilter,
        consumer: EventConsumer,
    ) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            id,
            Subscription {
                name: name.into(),
                filter,
                consumer,
            },
        );
        SubscriptionHandle { id }
    }

    /// Remove a subscription; unknown handles are ignored.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) { self.entries.remove(&handle.id); }

    /// Number of live subscriptions.
    #[must_use]
    pub fn len(&self) -> usize { self.entries.len() }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Offer a monitored SAL frame to every matching subscription.
    /// Returns true if anyone consumed it.
    pub(crate) fn dispatch_sal(&self, sal: &MonitoredSal) -> bool {
        let source = sal.source_path();
        let application = sal.application();
        let address = format!("sal/{}/{}", application.name(), sal.sal().command_name());
        let value = sal_value(sal.sal());
        let mut handled = false;
        for entry in &self.entries {
            let MonitorFilter::Sal {
                unit,
                application: wanted,
            } = &entry.filter
            else {
                // A subscription of the other kind is skipped silently.
                continue;
            };
            if !unit_matches(*unit, &source) || !application_matches(*wanted, application) {
                trace!(name = %entry.name, %source, "sal event filtered out");
                continue;
            }
            (entry.consumer)(SubscriptionEvent {
                name: entry.name.clone(),
                address: address.clone(),
                source: source.clone(),
                response_code: ResponseCode::Ok,
                value: value.clone(),
            });
            handled = true;
        }
        handled
    }

    /// Offer a monitored MMI (CAL status) reply to every matching
    /// subscription. Returns true if anyone consumed it.
    pub(crate) fn dispatch_mmi(&self, reply: &CalReply) -> bool {
        let source = reply.source_path();
        let Some((application, address, value)) = mmi_event(reply.cal()) else {
            debug!(%source, "monitored CAL reply carries no status, ignoring");
            return false;
        };
        let mut handled = false;
        for entry in &self.entries {
            let MonitorFilter::Mmi {
                unit,
                application: wanted,
            } = &entry.filter
            else {
                continue;
            };
            if !unit_matches(*unit, &source) || !application_matches(*wanted, application) {
                trace!(name = %entry.name, %source, "mmi event filtered out");
                continue;
            }
            (entry.consumer)(SubscriptionEvent {
                name: entry.name.clone(),
                address: address.clone(),
                source: source.clone(),
                response_code: ResponseCode::Ok,
                value: value.clone(),
            });
            handled = true;
        }
        handled
    }
}

fn unit_matches(wanted: Option<UnitAddress>, source: &str) -> bool {
    match wanted {
        None => true,
        Some(unit) => source.ends_with(&unit.to_string()),
    }
}

fn application_matches(wanted: Option<ApplicationId>, actual: ApplicationId) -> bool {
    match wanted {
        None => true,
        // Lighting spans a block of ids that all report the same
        // application name, so compare names rather than raw bytes.
        Some(wanted) => wanted.name() == actual.name(),
    }
}

fn sal_value(sal: &SalData) -> Value {
    match sal {
        SalData::Lighting(commands) => {
            let mut values: Vec<Value> = commands.iter().map(lighting_value).collect();
            if values.len() == 1 {
                values.remove(0)
            } else {
                Value::List(values)
            }
        }
        SalData::Raw { bytes } => Value::Bytes(bytes.clone()),
    }
}

fn lighting_value(command: &LightingData) -> Value {
    let mut fields = vec![
        ("command", Value::Str(command.command_name().to_owned())),
        ("group", Value::Byte(command.group())),
    ];
    if let LightingData::RampToLevel { rate, level, .. } = command {
        fields.push(("level", Value::Byte(*level)));
        fields.push(("rate", Value::Str(rate.name().to_owned())));
    }
    Value::Struct(
        fields
            .into_iter()
            .map(|(name, value)| (name.to_owned(), value))
            .collect(),
    )
}

/// Map a CAL status payload to `(application, address, value)`; `None` for
/// CAL data that is not monitored status.
fn mmi_event(cal: &CalData) -> Option<(ApplicationId, String, Value)> {
    let (application, block_start, payload, is_level) = match cal {
        CalData::Status {
            application,
            block_start,
            payload,
        } => (
            *application,
            *block_start,
            payload,
            matches!(payload, StatusPayload::Levels(_)),
        ),
        CalData::StatusExtended {
            coding,
            application,
            block_start,
            payload,
        } => (*application, *block_start, payload, coding.is_level()),
        _ => return None,
    };
    let status_kind = if is_level {
        format!("level=0x{block_start:02X}")
    } else {
        "binary".to_owned()
    };
    let address = format!("status/{}/{}", status_kind, application.name());
    let value = match payload {
        StatusPayload::Binary(status_bytes) => {
            let states: Vec<Value> = status_bytes
                .iter()
                .flat_map(|status| status.states())
                .map(|state| Value::Str(state.name().to_owned()))
                .collect();
            Value::structure([
                ("application", Value::Str(application.name())),
                ("blockStart", Value::Byte(block_start)),
                ("values", Value::List(states)),
            ])
        }
        StatusPayload::Levels(levels) => Value::List(
            levels
                .iter()
                .map(|level| match level {
                    crate::wire::LevelInformation::Normal(level) => Value::Byte(*level),
                    crate::wire::LevelInformation::Absent => Value::Str("is absent".to_owned()),
                    crate::wire::LevelInformation::Corrupted => Value::Str("corrupted".to_owned()),
                })
                .collect(),
        ),
    };
    Some((application, address, value))
}

/// Drain the monitored-traffic queues for the life of the connection,
/// delivering each event synchronously to matching consumers.
pub(crate) async fn run_dispatcher(
    registry: Arc<SubscriberRegistry>,
    mut sal_rx: mpsc::Receiver<MonitoredSal>,
    mut mmi_rx: mpsc::Receiver<CalReply>,
    shutdown: CancellationToken,
) {
    debug!("dispatch task started");
    loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => break,

            sal = sal_rx.recv() => match sal {
                Some(sal) => {
                    if registry.dispatch_sal(&sal) {
                        trace!("monitored sal handled");
                    }
                }
                None => break,
            },

            reply = mmi_rx.recv() => match reply {
                Some(reply) => {
                    if registry.dispatch_mmi(&reply) {
                        trace!("monitored mmi handled");
                    }
                }
                None => break,
            },
        }
    }
    info!("dispatch task ending");
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::wire::{BridgeAddress, NetworkRoute, ReplyAddress, StatusByte, StatusCoding};

    fn collector() -> (EventConsumer, Arc<Mutex<Vec<SubscriptionEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let consumer: EventConsumer = Arc::new(move |event| {
            sink.lock().unwrap().push(event);
        });
        (consumer, events)
    }

    fn lighting_sal(application: ApplicationId, unit: u8) -> MonitoredSal {
        MonitoredSal::Long {
            address: ReplyAddress::Unit(UnitAddress(unit)),
            application,
            sal: SalData::Lighting(vec![LightingData::On { group: 4 }]),
        }
    }

    #[test]
    fn mismatched_application_is_filtered_out() {
        let registry = SubscriberRegistry::default();
        let (consumer, events) = collector();
        registry.subscribe(
            "lights",
            MonitorFilter::Sal {
                unit: None,
                application: Some(ApplicationId::AIR_CONDITIONING),
            },
            consumer,
        );
        assert!(!registry.dispatch_sal(&lighting_sal(ApplicationId::LIGHTING, 5)));
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn matching_subscription_gets_exactly_one_event() {
        let registry = SubscriberRegistry::default();
        let (consumer, events) = collector();
        registry.subscribe(
            "lights",
            MonitorFilter::Sal {
                unit: None,
                application: Some(ApplicationId::LIGHTING),
            },
            consumer,
        );
        assert!(registry.dispatch_sal(&lighting_sal(ApplicationId::LIGHTING, 5)));
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.address, "sal/lighting/on");
        assert_eq!(event.source, "u5");
        assert!(event.response_code.is_ok());
    }

    #[test]
    fn unfiltered_subscription_matches_everything() {
        let registry = SubscriberRegistry::default();
        let (consumer, events) = collector();
        registry.subscribe(
            "all",
            MonitorFilter::Sal {
                unit: None,
                application: None,
            },
            consumer,
        );
        assert!(registry.dispatch_sal(&lighting_sal(ApplicationId::METERING, 9)));
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn unit_filter_uses_the_path_suffix() {
        let registry = SubscriberRegistry::default();
        let (consumer, events) = collector();
        registry.subscribe(
            "unit5",
            MonitorFilter::Sal {
                unit: Some(UnitAddress(5)),
                application: None,
            },
            consumer,
        );
        let bridged = MonitoredSal::Long {
            address: ReplyAddress::Bridged {
                bridge: BridgeAddress(2),
                route: NetworkRoute {
                    additional_bridges: vec![BridgeAddress(3)],
                },
                unit: UnitAddress(5),
            },
            application: ApplicationId::LIGHTING,
            sal: SalData::Lighting(vec![LightingData::Off { group: 1 }]),
        };
        assert!(registry.dispatch_sal(&bridged));
        assert_eq!(events.lock().unwrap()[0].source, "b2-b3-u5");

        assert!(!registry.dispatch_sal(&lighting_sal(ApplicationId::LIGHTING, 6)));
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn sal_subscription_ignores_mmi_and_vice_versa() {
        let registry = SubscriberRegistry::default();
        let (consumer, events) = collector();
        registry.subscribe(
            "mmi-only",
            MonitorFilter::Mmi {
                unit: None,
                application: None,
            },
            consumer,
        );
        assert!(!registry.dispatch_sal(&lighting_sal(ApplicationId::LIGHTING, 5)));
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn mmi_status_renders_binary_address_and_values() {
        let registry = SubscriberRegistry::default();
        let (consumer, events) = collector();
        registry.subscribe(
            "status",
            MonitorFilter::Mmi {
                unit: None,
                application: Some(ApplicationId::LIGHTING),
            },
            consumer,
        );
        let reply = CalReply::Long {
            address: ReplyAddress::Unit(UnitAddress(4)),
            serial_interface: 2,
            cal: CalData::StatusExtended {
                coding: StatusCoding::BinaryByElsewhere,
                application: ApplicationId::LIGHTING,
                block_start: 0,
                payload: StatusPayload::Binary(vec![StatusByte::from_byte(0x01)]),
            },
        };
        assert!(registry.dispatch_mmi(&reply));
        let events = events.lock().unwrap();
        assert_eq!(events[0].address, "status/binary/lighting");
        assert_eq!(events[0].source, "u4");
        match &events[0].value {
            Value::Struct(fields) => match &fields["values"] {
                Value::List(states) => {
                    assert_eq!(states.len(), 4);
                    assert_eq!(states[3], Value::Str("on".to_owned()));
                }
                other => panic!("expected list, got {other:?}"),
            },
            other => panic!("expected struct, got {other:?}"),
        }
    }

    #[test]
    fn unsubscribed_consumer_stops_receiving() {
        let registry = SubscriberRegistry::default();
        let (consumer, events) = collector();
        let handle = registry.subscribe(
            "temporary",
            MonitorFilter::Sal {
                unit: None,
                application: None,
            },
            consumer,
        );
        assert!(registry.dispatch_sal(&lighting_sal(ApplicationId::LIGHTING, 5)));
        registry.unsubscribe(handle);
        assert!(!registry.dispatch_sal(&lighting_sal(ApplicationId::LIGHTING, 5)));
        assert_eq!(events.lock().unwrap().len(), 1);
    }
}
