//! Cross-session fan-out (§4.6).
//!
//! A session only ever mutates its own state; once it hands back a
//! [`SessionEvent::Publish`], routing it to every other (and the same)
//! session is the broker's job so that no session method ever needs a
//! mutable borrow of two sessions at once.

use mqtt_core::QoS;
use slab::Slab;

use crate::session::{Session, Will};

/// Deliver `payload` on `topic` to every connected session whose own
/// subscriptions match, including the session that published it.
pub fn route_publish(sessions: &mut Slab<Session>, topic: &str, payload: &[u8], qos: QoS) {
    for (_, session) in sessions.iter_mut() {
        session.route_incoming_publish(topic, payload, qos);
    }
}

/// Publish a disconnected client's Last Will. The dying session has already
/// been removed from `sessions` by the time this runs, so it is excluded
/// from fan-out as a side effect of no longer being in the table, not
/// because of any explicit check here.
pub fn route_will(sessions: &mut Slab<Session>, will: &Will) {
    route_publish(sessions, &will.topic, &will.payload, will.qos);
}
