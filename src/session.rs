use crate::cable::CableConnection;
use crate::models::User;

/// Authenticated identity plus the one shared cable connection. Owned by
/// the top level of the app and passed down explicitly; there is no global
/// state to reach for.
#[derive(Debug, Default)]
pub struct Session {
    token: Option<String>,
    user: Option<User>,
    connection: Option<CableConnection>,
}

impl Session {
    pub fn new() -> Self {
        Session::default()
    }

    pub fn log_in(&mut self, token: String, user: User) {
        log::info!("logged in as {} (id {})", user.username, user.id);
        self.token = Some(token);
        self.user = Some(user);
    }

    /// Clears credentials and tears the cable down.
    pub fn log_out(&mut self) {
        self.disconnect_cable();
        if let Some(user) = self.user.take() {
            log::info!("logged out {}", user.username);
        }
        self.token = None;
    }

    /// Drop the socket without touching credentials. The next chat flow
    /// sees `needs_connection()` and redials.
    pub fn disconnect_cable(&mut self) {
        if let Some(conn) = self.connection.take() {
            conn.shutdown();
        }
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn current_user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    /// Adopt a freshly dialed connection. If the session was logged out
    /// while the dial was in flight, the connection is discarded instead.
    pub fn attach_connection(&mut self, conn: CableConnection) {
        if self.token.is_none() {
            log::warn!("dropping cable connection attached after logout");
            conn.shutdown();
            return;
        }
        if let Some(old) = self.connection.replace(conn) {
            old.shutdown();
        }
    }

    /// The shared connection, or `None` in degraded REST-only mode (no
    /// credential, or the socket has died and awaits a redial). Never
    /// errors: absence is a defined mode, not a failure.
    pub fn connection(&self) -> Option<&CableConnection> {
        self.token.as_ref()?;
        self.connection.as_ref().filter(|c| c.is_alive())
    }

    /// True when a redial would help: authenticated but no live socket.
    pub fn needs_connection(&self) -> bool {
        self.token.is_some() && self.connection().is_none()
    }
}
