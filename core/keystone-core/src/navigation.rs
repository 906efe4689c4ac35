//! Navigation seam between the session library and its host.

use std::sync::Mutex;

pub const LOGIN_ROUTE: &str = "/login";
pub const DEFAULT_ROUTE: &str = "/workspace";

pub trait Navigator: Send + Sync {
    fn current_route(&self) -> String;

    fn navigate(&self, route: &str);

    fn is_on_login(&self) -> bool {
        self.current_route() == LOGIN_ROUTE
    }

    /// Sends the user to the login entry point unless already there.
    fn redirect_to_login(&self) {
        if !self.is_on_login() {
            tracing::info!(from = %self.current_route(), "Redirecting to login");
            self.navigate(LOGIN_ROUTE);
        }
    }
}

/// Keeps the current route in memory and remembers every navigation.
#[derive(Debug)]
pub struct RecordingNavigator {
    history: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    pub fn new(initial_route: &str) -> Self {
        Self {
            history: Mutex::new(vec![initial_route.to_string()]),
        }
    }

    /// Routes visited after the initial one.
    pub fn navigations(&self) -> Vec<String> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.iter().skip(1).cloned().collect()
    }
}

impl Navigator for RecordingNavigator {
    fn current_route(&self) -> String {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.last().cloned().unwrap_or_else(|| LOGIN_ROUTE.to_string())
    }

    fn navigate(&self, route: &str) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push(route.to_string());
    }
}
