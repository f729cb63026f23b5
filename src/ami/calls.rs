use super::codec::AmiEvent;
use crate::config::AmiConfig;
use crate::event::{EventSender, PbxEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Incoming,
    Outgoing,
    Internal,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    Up,
    Connected,
    Ended,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Completed,
    Missed,
}

/// One channel as seen by the switch, keyed by its `Uniqueid`.
#[derive(Clone, Debug, Serialize)]
pub struct Call {
    pub id: String,
    pub channel: String,
    pub caller_number: String,
    pub caller_name: String,
    pub destination: String,
    pub context: String,
    pub direction: CallDirection,
    pub status: CallStatus,
    pub start_time: DateTime<Utc>,
    pub answer_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds between answer and hangup, zero until the call ends
    pub duration: u64,
    pub linked_channel: Option<String>,
    pub bridge_peer: Option<String>,
    pub hangup_cause: Option<String>,
    #[serde(skip)]
    announced: bool,
    #[serde(skip)]
    updated_at: DateTime<Utc>,
}

impl Call {
    pub fn is_answered(&self) -> bool {
        self.answer_time.is_some()
    }

    pub fn is_ended(&self) -> bool {
        self.status == CallStatus::Ended
    }

    pub fn outcome(&self) -> CallOutcome {
        if self.is_answered() {
            CallOutcome::Completed
        } else {
            CallOutcome::Missed
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn incoming_event(&mut self) -> Option<PbxEvent> {
        if self.announced || self.direction != CallDirection::Incoming {
            return None;
        }
        self.announced = true;
        Some(PbxEvent::IncomingCall {
            call_id: self.id.clone(),
            caller_number: self.caller_number.clone(),
            caller_name: self.caller_name.clone(),
            destination: self.destination.clone(),
            start_time: self.start_time,
        })
    }
}

/// Owns every tracked call and advances it as manager events arrive.
/// Readers only ever receive cloned snapshots.
pub struct CallTable {
    config: Arc<AmiConfig>,
    calls: RwLock<HashMap<String, Call>>,
    bridges: Mutex<HashMap<String, Vec<String>>>,
    event_sender: EventSender,
}

pub type CallTableRef = Arc<CallTable>;

impl CallTable {
    pub fn new(config: Arc<AmiConfig>, event_sender: EventSender) -> CallTableRef {
        Arc::new(Self {
            config,
            calls: RwLock::new(HashMap::new()),
            bridges: Mutex::new(HashMap::new()),
            event_sender,
        })
    }

    fn emit(&self, events: Vec<PbxEvent>) {
        for event in events {
            self.event_sender.send(event).ok();
        }
    }

    fn classify(&self, context: &str, caller: &str, destination: &str) -> CallDirection {
        if self.config.is_trunk_context(context) {
            CallDirection::Incoming
        } else if self.config.is_managed_extension(caller)
            && self.config.is_managed_extension(destination)
        {
            CallDirection::Internal
        } else {
            CallDirection::Outgoing
        }
    }

    pub fn on_new_channel(&self, event: &AmiEvent) {
        let Some(id) = event.get("Uniqueid").filter(|id| !id.is_empty()) else {
            debug!("Newchannel without Uniqueid");
            return;
        };
        let context = event.fields.value("Context");
        let caller_number = event.fields.value("CallerIDNum");
        let destination = event.fields.value("Exten");
        let direction = self.classify(&context, &caller_number, &destination);

        let mut events = vec![];
        {
            let mut calls = self.calls.write().unwrap();
            if calls.contains_key(id) {
                return;
            }
            let mut call = Call {
                id: id.to_string(),
                channel: event.fields.value("Channel"),
                caller_number,
                caller_name: event.fields.value("CallerIDName"),
                destination,
                context,
                direction,
                status: CallStatus::Ringing,
                start_time: Utc::now(),
                answer_time: None,
                end_time: None,
                duration: 0,
                linked_channel: None,
                bridge_peer: None,
                hangup_cause: None,
                announced: false,
                updated_at: Utc::now(),
            };
            info!(
                call_id = %call.id,
                channel = %call.channel,
                direction = ?call.direction,
                "call created"
            );
            events.extend(call.incoming_event());
            calls.insert(call.id.clone(), call);
        }
        self.emit(events);
    }

    pub fn on_new_state(&self, event: &AmiEvent) {
        let Some(id) = event.get("Uniqueid") else {
            return;
        };
        let state = event.get("ChannelStateDesc").unwrap_or_default();

        let mut events = vec![];
        {
            let mut calls = self.calls.write().unwrap();
            let Some(call) = calls.get_mut(id).filter(|c| !c.is_ended()) else {
                return;
            };
            call.touch();
            match state {
                "Up" => {
                    if call.answer_time.is_none() {
                        call.answer_time = Some(Utc::now());
                        if call.status == CallStatus::Ringing {
                            call.status = CallStatus::Up;
                        }
                        events.push(PbxEvent::CallAnswered {
                            call_id: call.id.clone(),
                            from: call.caller_number.clone(),
                            to: call.destination.clone(),
                            direction: call.direction,
                        });
                    }
                }
                "Ringing" | "Ring" => events.extend(call.incoming_event()),
                _ => {}
            }
        }
        self.emit(events);
    }

    pub fn on_dial_begin(&self, source_id: &str, dest_id: &str) {
        if let Some(call) = self.calls.write().unwrap().get_mut(source_id) {
            debug!(call_id = source_id, dest_id, "dial begin");
            call.linked_channel = Some(dest_id.to_string());
            call.touch();
        }
    }

    pub fn on_bridge(&self, first: &str, second: &str) {
        let mut calls = self.calls.write().unwrap();
        for (id, peer) in [(first, second), (second, first)] {
            if let Some(call) = calls.get_mut(id).filter(|c| !c.is_ended()) {
                call.status = CallStatus::Connected;
                call.bridge_peer = Some(peer.to_string());
                call.touch();
            }
        }
        debug!(first, second, "channels bridged");
    }

    /// A channel entered a bridge; pair it with a channel already in there.
    pub fn on_bridge_enter(&self, bridge_id: &str, channel_id: &str) {
        let peer = {
            let mut bridges = self.bridges.lock().unwrap();
            let members = bridges.entry(bridge_id.to_string()).or_default();
            let peer = members.iter().find(|m| *m != channel_id).cloned();
            if !members.iter().any(|m| m == channel_id) {
                members.push(channel_id.to_string());
            }
            peer
        };
        if let Some(peer) = peer {
            self.on_bridge(&peer, channel_id);
        }
    }

    pub fn on_bridge_leave(&self, bridge_id: &str, channel_id: &str) {
        let mut bridges = self.bridges.lock().unwrap();
        if let Some(members) = bridges.get_mut(bridge_id) {
            members.retain(|m| m != channel_id);
            if members.is_empty() {
                bridges.remove(bridge_id);
            }
        }
    }

    pub fn on_bridge_destroy(&self, bridge_id: &str) {
        self.bridges.lock().unwrap().remove(bridge_id);
    }

    pub fn on_hangup(self: &Arc<Self>, event: &AmiEvent) {
        let Some(id) = event.get("Uniqueid") else {
            return;
        };
        let cause = event
            .get("Cause-txt")
            .filter(|c| !c.is_empty())
            .map(|c| c.to_string());

        let ended = {
            let mut calls = self.calls.write().unwrap();
            let Some(call) = calls.get_mut(id).filter(|c| !c.is_ended()) else {
                return;
            };
            let end_time = Utc::now();
            call.duration = call
                .answer_time
                .map(|answered| (end_time - answered).num_seconds().max(0) as u64)
                .unwrap_or(0);
            call.end_time = Some(end_time);
            call.status = CallStatus::Ended;
            call.hangup_cause = cause;
            call.touch();
            info!(
                call_id = %call.id,
                duration = call.duration,
                outcome = ?call.outcome(),
                cause = ?call.hangup_cause,
                "call ended"
            );
            PbxEvent::CallEnded {
                call_id: call.id.clone(),
                from: call.caller_number.clone(),
                to: call.destination.clone(),
                direction: call.direction,
                duration: call.duration,
                outcome: call.outcome(),
                cause: call.hangup_cause.clone(),
            }
        };
        self.emit(vec![ended]);
        self.schedule_removal(id.to_string());
    }

    fn schedule_removal(self: &Arc<Self>, id: String) {
        let weak = Arc::downgrade(self);
        let grace = self.config.ended_call_grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(table) = weak.upgrade() {
                table.remove(&id);
                debug!(call_id = %id, "call purged");
            }
        });
    }

    /// Drop calls that have not changed for `max_age`, along with bridge
    /// members that are no longer tracked. Run after a reconnect, since
    /// hangups sent while the link was down are never replayed.
    pub fn purge_stale(&self, max_age: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };
        let mut calls = self.calls.write().unwrap();
        let before = calls.len();
        calls.retain(|id, call| {
            let keep = call.updated_at > cutoff;
            if !keep {
                debug!(call_id = %id, status = ?call.status, "stale call dropped");
            }
            keep
        });
        self.bridges.lock().unwrap().retain(|_, members| {
            members.retain(|m| calls.contains_key(m));
            !members.is_empty()
        });
        before - calls.len()
    }

    pub fn remove(&self, id: &str) -> Option<Call> {
        self.calls.write().unwrap().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Call> {
        self.calls.read().unwrap().get(id).cloned()
    }

    pub fn count(&self) -> usize {
        self.calls.read().unwrap().len()
    }

    pub fn list(&self) -> Vec<Call> {
        let mut calls: Vec<_> = self.calls.read().unwrap().values().cloned().collect();
        calls.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        calls
    }
}
