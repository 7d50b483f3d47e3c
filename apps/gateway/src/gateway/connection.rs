use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::events::Envelope;
use super::session::Session;
use crate::error::GatewayError;
use crate::models::user::User;

/// Frames queued for the socket writer task.
#[derive(Debug)]
pub enum Outbound {
    Envelope(Envelope),
    Close { code: u16, reason: String },
}

/// One live client connection on this process.
///
/// Everything here is process-local. The bound [`Session`] is a working copy;
/// the durable record lives in the session directory.
pub struct Connection {
    pub id: String,
    session: Mutex<Session>,
    user: Mutex<Option<User>>,
    /// Room whose channel this connection holds a dispatcher reference on.
    registered_room: Mutex<Option<String>>,
    /// Pending registration of the user channel, resolved on disconnect.
    user_registration: Mutex<Option<JoinHandle<bool>>>,
    /// Set once another connection has resumed this connection's session.
    superseded: AtomicBool,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Connection {
    pub fn open() -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            id: roomcast_common::id::prefixed_ulid(roomcast_common::id::prefix::CONNECTION),
            session: Mutex::new(Session::new()),
            user: Mutex::new(None),
            registered_room: Mutex::new(None),
            user_registration: Mutex::new(None),
            superseded: AtomicBool::new(false),
            tx,
        });
        (conn, rx)
    }

    // -- session -------------------------------------------------------------

    pub fn session(&self) -> Session {
        self.session.lock().clone()
    }

    pub fn session_id(&self) -> String {
        self.session.lock().id.clone()
    }

    pub fn user_id(&self) -> Option<String> {
        self.session.lock().user_id.clone()
    }

    pub fn room_id(&self) -> Option<String> {
        self.session.lock().room_id.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.lock().user_id.is_some()
    }

    pub fn replace_session(&self, session: Session) {
        *self.session.lock() = session;
    }

    /// Hand the session over to another connection. From here on this
    /// connection no longer speaks for it: routing skips it and its teardown
    /// leaves the stored session and room membership alone.
    pub fn supersede(&self) {
        self.superseded.store(true, Ordering::SeqCst);
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded.load(Ordering::SeqCst)
    }

    /// Mutate the bound session and return the updated copy.
    pub fn update_session(&self, f: impl FnOnce(&mut Session)) -> Session {
        let mut session = self.session.lock();
        f(&mut session);
        session.clone()
    }

    // -- user ----------------------------------------------------------------

    pub fn user(&self) -> Option<User> {
        self.user.lock().clone()
    }

    pub fn set_user(&self, user: User) {
        *self.user.lock() = Some(user);
    }

    // -- dispatcher bookkeeping ---------------------------------------------

    pub fn registered_room(&self) -> Option<String> {
        self.registered_room.lock().clone()
    }

    pub fn set_registered_room(&self, room_id: String) {
        *self.registered_room.lock() = Some(room_id);
    }

    pub fn take_registered_room(&self) -> Option<String> {
        self.registered_room.lock().take()
    }

    pub fn set_user_registration(&self, handle: JoinHandle<bool>) {
        *self.user_registration.lock() = Some(handle);
    }

    pub fn take_user_registration(&self) -> Option<JoinHandle<bool>> {
        self.user_registration.lock().take()
    }

    // -- outbound ------------------------------------------------------------

    /// Queue an envelope, stamping `t` if unset.
    pub fn send(&self, mut envelope: Envelope) -> Result<(), GatewayError> {
        envelope.stamp();
        self.tx
            .send(Outbound::Envelope(envelope))
            .map_err(|_| GatewayError::Send)
    }

    pub fn reply<T: Serialize>(&self, op: u8, data: &T) -> Result<(), GatewayError> {
        self.send(Envelope::with_data(op, data, None)?)
    }

    /// Ask the writer to close the socket. Ignored if it is already gone.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.tx.send(Outbound::Close {
            code,
            reason: reason.into(),
        });
    }
}
