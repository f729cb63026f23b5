use super::calls::CallTableRef;
use super::codec::AmiEvent;
use super::extension::{ExtensionStatus, ExtensionTracker};
use crate::event::{EventSender, PbxEvent};
use std::sync::Arc;
use tracing::{debug, trace};

/// Routes manager events to the call table and the extension cache.
/// Unknown or malformed events are dropped.
pub struct EventDispatcher {
    calls: CallTableRef,
    extensions: Arc<ExtensionTracker>,
    event_sender: EventSender,
}

impl EventDispatcher {
    pub fn new(
        calls: CallTableRef,
        extensions: Arc<ExtensionTracker>,
        event_sender: EventSender,
    ) -> Self {
        Self {
            calls,
            extensions,
            event_sender,
        }
    }

    pub fn dispatch(&self, event: &AmiEvent) {
        match event.name() {
            "Newchannel" => self.calls.on_new_channel(event),
            "Newstate" => self.calls.on_new_state(event),
            "DialBegin" => self.on_dial(event, "Uniqueid", "DestUniqueid"),
            "Dial" if event.get("SubEvent") == Some("Begin") => {
                self.on_dial(event, "UniqueID", "DestUniqueID")
            }
            "Bridge" if event.get("Bridgestate") != Some("Unlink") => {
                if let (Some(first), Some(second)) = (event.get("Uniqueid1"), event.get("Uniqueid2"))
                {
                    self.calls.on_bridge(first, second);
                }
            }
            "BridgeEnter" => {
                if let (Some(bridge), Some(channel)) =
                    (event.get("BridgeUniqueid"), event.get("Uniqueid"))
                {
                    self.calls.on_bridge_enter(bridge, channel);
                }
            }
            "BridgeLeave" => {
                if let (Some(bridge), Some(channel)) =
                    (event.get("BridgeUniqueid"), event.get("Uniqueid"))
                {
                    self.calls.on_bridge_leave(bridge, channel);
                }
            }
            "BridgeDestroy" => {
                if let Some(bridge) = event.get("BridgeUniqueid") {
                    self.calls.on_bridge_destroy(bridge);
                }
            }
            "Hangup" => self.calls.on_hangup(event),
            "ExtensionStatus" => self.on_extension_status(event),
            "DeviceStateChange" => {
                debug!(
                    device = event.get("Device").unwrap_or_default(),
                    state = event.get("State").unwrap_or_default(),
                    "device state changed"
                );
            }
            other => trace!(event = other, "ignored event"),
        }
    }

    fn on_dial(&self, event: &AmiEvent, source_key: &str, dest_key: &str) {
        if let (Some(source), Some(dest)) = (event.get(source_key), event.get(dest_key)) {
            self.calls.on_dial_begin(source, dest);
        }
    }

    fn on_extension_status(&self, event: &AmiEvent) {
        let Some(extension) = event.get("Exten").filter(|e| !e.is_empty()) else {
            return;
        };
        let (status, code) = ExtensionStatus::from_field(event.get("Status"));
        self.extensions.update(extension, code);
        debug!(extension, ?status, code, "extension status");
        self.event_sender
            .send(PbxEvent::ExtensionStatus {
                extension: extension.to_string(),
                status,
                code,
            })
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ami::calls::{CallStatus, CallTable};
    use crate::ami::codec::Fields;
    use crate::config::AmiConfig;
    use crate::event::create_event_sender;
    use std::time::Duration;

    fn event(pairs: &[(&str, &str)]) -> AmiEvent {
        AmiEvent {
            fields: pairs.iter().copied().collect::<Fields>(),
        }
    }

    fn dispatcher() -> (EventDispatcher, CallTableRef, Arc<ExtensionTracker>, crate::event::EventReceiver) {
        let sender = create_event_sender();
        let receiver = sender.subscribe();
        let calls = CallTable::new(Arc::new(AmiConfig::default()), sender.clone());
        let extensions = Arc::new(ExtensionTracker::new(Duration::from_secs(5)));
        (
            EventDispatcher::new(calls.clone(), extensions.clone(), sender),
            calls,
            extensions,
            receiver,
        )
    }

    #[tokio::test]
    async fn test_full_lifecycle_event_order() {
        let (dispatcher, calls, _, mut rx) = dispatcher();
        let stream = [
            event(&[
                ("Event", "Newchannel"),
                ("Channel", "PJSIP/trunk-00000001"),
                ("CallerIDNum", "5551234"),
                ("Exten", "100"),
                ("Context", "from-trunk"),
                ("Uniqueid", "A"),
            ]),
            event(&[("Event", "Newstate"), ("Uniqueid", "A"), ("ChannelStateDesc", "Ringing")]),
            event(&[("Event", "Newchannel"), ("Uniqueid", "B"), ("Context", "from-internal"), ("Exten", "100")]),
            event(&[("Event", "DialBegin"), ("Uniqueid", "A"), ("DestUniqueid", "B")]),
            event(&[("Event", "Newstate"), ("Uniqueid", "A"), ("ChannelStateDesc", "Up")]),
            event(&[("Event", "Bridge"), ("Bridgestate", "Link"), ("Uniqueid1", "A"), ("Uniqueid2", "B")]),
            event(&[("Event", "Hangup"), ("Uniqueid", "A"), ("Cause-txt", "Normal")]),
        ];
        for ev in &stream {
            dispatcher.dispatch(ev);
        }

        let a = calls.get("A").unwrap();
        assert_eq!(a.linked_channel.as_deref(), Some("B"));
        assert_eq!(a.bridge_peer.as_deref(), Some("B"));
        assert_eq!(a.status, CallStatus::Ended);

        let mut names = vec![];
        while let Ok(ev) = rx.try_recv() {
            names.push(ev.name());
        }
        assert_eq!(names, vec!["incoming_call", "call_answered", "call_ended"]);
    }

    #[tokio::test]
    async fn test_extension_status_updates_cache() {
        let (dispatcher, _, extensions, mut rx) = dispatcher();
        dispatcher.dispatch(&event(&[
            ("Event", "ExtensionStatus"),
            ("Exten", "101"),
            ("Context", "ext-local"),
            ("Status", "8"),
        ]));
        assert_eq!(
            extensions.get_fresh("101").map(|s| s.status),
            Some(ExtensionStatus::Ringing)
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            PbxEvent::ExtensionStatus {
                extension: "101".to_string(),
                status: ExtensionStatus::Ringing,
                code: 8,
            }
        );

        dispatcher.dispatch(&event(&[
            ("Event", "ExtensionStatus"),
            ("Exten", "102"),
            ("Status", "99"),
        ]));
        assert_eq!(
            extensions.get_fresh("102").map(|s| s.status),
            Some(ExtensionStatus::Unknown)
        );
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_events_are_ignored() {
        let (dispatcher, calls, extensions, mut rx) = dispatcher();
        dispatcher.dispatch(&event(&[("Event", "PeerStatus"), ("Peer", "PJSIP/100")]));
        dispatcher.dispatch(&event(&[("Event", "DeviceStateChange"), ("Device", "PJSIP/100"), ("State", "INUSE")]));
        dispatcher.dispatch(&event(&[("Event", "DialBegin")]));
        dispatcher.dispatch(&event(&[("Event", "ExtensionStatus")]));
        dispatcher.dispatch(&event(&[("Event", "Bridge"), ("Uniqueid1", "A")]));
        dispatcher.dispatch(&event(&[("Event", "")]));
        assert_eq!(calls.count(), 0);
        assert_eq!(extensions.count(), 0);
        assert!(rx.try_recv().is_err());
    }
}
