//! Tool-call dispatcher: runs backend-requested side effects one at a time.
//!
//! Per invocation: `Received → Guarded → Effecting → Responded`. A single guard
//! serializes effects on the shared `AppState`; an invocation that arrives while
//! the guard is held (or cooling down) is dropped without a response. Effects
//! always yield text, failures included, and the guard is released by the
//! permit's `Drop`.

use crate::error::{RealtimeError, RealtimeResult};
use crate::lookup::{Property, PropertyLookup};
use crate::transport::{Connection, ToolInvocation};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const TOOL_SEARCH: &str = "search_properties";
pub const TOOL_SHOW_PREVIOUS: &str = "show_previous_property";
pub const TOOL_SHOW_LEAD_FORM: &str = "show_lead_form";
pub const TOOL_HIDE_PROPERTY: &str = "hide_property";

/// Returned to the backend when an effect fails internally.
pub const TOOL_APOLOGY: &str =
    "Sorry, something went wrong while handling that request. Please tell the user and offer to try again.";

/// Properties shown during this visit, oldest first, one entry per id.
#[derive(Debug, Clone, Default)]
pub struct PropertyHistory {
    items: Vec<Property>,
}

impl PropertyHistory {
    /// Append unless a property with the same id is already present.
    /// Returns the 1-based position of the property.
    pub fn push(&mut self, property: Property) -> usize {
        if let Some(pos) = self.items.iter().position(|p| p.id == property.id) {
            return pos + 1;
        }
        self.items.push(property);
        self.items.len()
    }

    /// 1-based lookup.
    pub fn get(&self, index: usize) -> Option<&Property> {
        index.checked_sub(1).and_then(|i| self.items.get(i))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.items.iter()
    }
}

/// UI-facing state mutated by tool effects.
#[derive(Debug, Clone, Default)]
pub struct AppState {
    pub current: Option<Property>,
    pub history: PropertyHistory,
    pub property_visible: bool,
    pub lead_form_visible: bool,
}

impl AppState {
    /// Forget everything shown; used when the voice surface is exited.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

pub type SharedAppState = Arc<Mutex<AppState>>;

/// The dispatcher's single mutual-exclusion flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Open,
    Held,
    /// Released, waiting out the cool-down before accepting again.
    CoolingDown,
}

/// Lifecycle of one invocation, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStage {
    Received,
    Guarded,
    Effecting,
    Responded,
}

#[derive(Debug)]
struct Guard {
    state: GuardState,
    /// Bumped by `reset`; permits from an older epoch no longer touch the guard.
    epoch: u64,
}

fn lock_guard(guard: &Mutex<Guard>) -> std::sync::MutexGuard<'_, Guard> {
    guard.lock().unwrap_or_else(|e| e.into_inner())
}

/// Proof of holding the guard. Dropping it starts the cool-down.
#[must_use = "dropping the permit releases the guard"]
pub struct DispatchPermit {
    guard: Arc<Mutex<Guard>>,
    epoch: u64,
    cooldown: Duration,
}

impl Drop for DispatchPermit {
    fn drop(&mut self) {
        let epoch = self.epoch;
        let reopen = move |guard: &Mutex<Guard>| {
            let mut g = lock_guard(guard);
            if g.epoch == epoch && g.state == GuardState::CoolingDown {
                g.state = GuardState::Open;
            }
        };

        {
            let mut g = lock_guard(&self.guard);
            if g.epoch != epoch {
                return;
            }
            g.state = GuardState::CoolingDown;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(rt) if !self.cooldown.is_zero() => {
                let guard = Arc::clone(&self.guard);
                let cooldown = self.cooldown;
                rt.spawn(async move {
                    tokio::time::sleep(cooldown).await;
                    reopen(&guard);
                    debug!("🔓 Tool guard reopened");
                });
            }
            _ => reopen(&self.guard),
        }
    }
}

/// Serializes tool effects and reports results back to the backend.
pub struct ToolCallDispatcher {
    lookup: Arc<dyn PropertyLookup>,
    state: SharedAppState,
    guard: Arc<Mutex<Guard>>,
    cooldown: Duration,
}

impl ToolCallDispatcher {
    pub fn new(lookup: Arc<dyn PropertyLookup>, state: SharedAppState, cooldown: Duration) -> Self {
        Self {
            lookup,
            state,
            guard: Arc::new(Mutex::new(Guard {
                state: GuardState::Open,
                epoch: 0,
            })),
            cooldown,
        }
    }

    pub fn state(&self) -> &SharedAppState {
        &self.state
    }

    pub fn guard_state(&self) -> GuardState {
        lock_guard(&self.guard).state
    }

    /// Take the guard if it is open.
    pub fn try_acquire(&self) -> Option<DispatchPermit> {
        let mut g = lock_guard(&self.guard);
        if g.state != GuardState::Open {
            return None;
        }
        g.state = GuardState::Held;
        Some(DispatchPermit {
            guard: Arc::clone(&self.guard),
            epoch: g.epoch,
            cooldown: self.cooldown,
        })
    }

    /// Reopen the guard, orphaning any outstanding permit and cool-down.
    ///
    /// Called when a session ends so the next one starts with a free guard.
    pub fn reset(&self) {
        let mut g = lock_guard(&self.guard);
        g.epoch += 1;
        if g.state != GuardState::Open {
            debug!("🔓 Tool guard reset from {:?}", g.state);
        }
        g.state = GuardState::Open;
    }

    /// Accept `invocation` if the guard is free and run it on a spawned task.
    ///
    /// The effect is abandoned, without a response or state change, once
    /// `cancel` fires. Returns false when the invocation was dropped. Must be
    /// called inside a tokio runtime.
    pub fn submit(
        self: &Arc<Self>,
        invocation: ToolInvocation,
        connection: Weak<dyn Connection>,
        cancel: CancellationToken,
    ) -> bool {
        debug!("🛠️ {} ({}) {:?}", invocation.name, invocation.id, DispatchStage::Received);
        let Some(permit) = self.try_acquire() else {
            info!("🛠️ Dropping {} ({}): another tool call is in flight", invocation.name, invocation.id);
            return false;
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.dispatch(permit, invocation, connection, cancel).await;
        });
        true
    }

    /// Effect the invocation under `permit` and send the result.
    pub async fn dispatch(
        &self,
        permit: DispatchPermit,
        invocation: ToolInvocation,
        connection: Weak<dyn Connection>,
        cancel: CancellationToken,
    ) {
        debug!("🛠️ {} ({}) {:?}", invocation.name, invocation.id, DispatchStage::Guarded);
        let text = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            text = self.effect(&invocation, &cancel) => text,
        };
        drop(permit);

        let Some(text) = text else {
            debug!("Session ended; abandoning {} ({})", invocation.name, invocation.id);
            return;
        };
        match connection.upgrade() {
            Some(conn) => {
                if let Err(e) = conn.send_tool_result(&invocation.id, &text) {
                    warn!("Tool result for {} not delivered: {}", invocation.id, e);
                }
                debug!("🛠️ {} ({}) {:?}", invocation.name, invocation.id, DispatchStage::Responded);
            }
            None => debug!("Connection gone; discarding result for {}", invocation.id),
        }
    }

    /// Run the effect. Errors become an apology string; `None` means `cancel`
    /// fired first and nothing was changed.
    pub async fn effect(&self, invocation: &ToolInvocation, cancel: &CancellationToken) -> Option<String> {
        debug!("🛠️ {} ({}) {:?}", invocation.name, invocation.id, DispatchStage::Effecting);
        match self.run_tool(invocation, cancel).await {
            Ok(text) => Some(text),
            Err(e) if e.is_cancelled() => None,
            Err(e) => {
                warn!("Tool {} failed: {}", invocation.name, e);
                Some(TOOL_APOLOGY.to_string())
            }
        }
    }

    async fn run_tool(&self, invocation: &ToolInvocation, cancel: &CancellationToken) -> RealtimeResult<String> {
        match invocation.name.as_str() {
            TOOL_SEARCH => self.search(&invocation.args, cancel).await,
            TOOL_SHOW_PREVIOUS => self.show_previous(&invocation.args, cancel),
            TOOL_SHOW_LEAD_FORM => self.show_lead_form(cancel),
            TOOL_HIDE_PROPERTY => self.hide_property(cancel),
            other => Ok(format!("Unknown tool \"{}\". No action was taken.", other)),
        }
    }

    /// Apply `change` to the shared state while the session is still live.
    fn commit<R>(&self, cancel: &CancellationToken, change: impl FnOnce(&mut AppState) -> R) -> RealtimeResult<R> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if cancel.is_cancelled() {
            return Err(RealtimeError::Cancelled);
        }
        Ok(change(&mut state))
    }

    async fn search(&self, args: &Value, cancel: &CancellationToken) -> RealtimeResult<String> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|q| !q.is_empty());
        let Some(query) = query else {
            return Ok("A search query is required to look for properties.".to_string());
        };

        let results = self
            .lookup
            .search(query)
            .await
            .map_err(|e| RealtimeError::ToolEffect(e.to_string()))?;

        let Some(first) = results.first().cloned() else {
            let kind = args
                .get("property_type")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .unwrap_or(query);
            let alternatives = self
                .lookup
                .alternatives(kind)
                .await
                .map_err(|e| RealtimeError::ToolEffect(e.to_string()))?;
            return Ok(if alternatives.is_empty() {
                format!("No properties matched \"{}\" and no alternative locations are available.", query)
            } else {
                format!(
                    "No properties matched \"{}\". Similar properties are available in: {}.",
                    query,
                    alternatives.join(", ")
                )
            });
        };

        let description = first.describe();
        let position = self.commit(cancel, |state| {
            let position = state.history.push(first.clone());
            state.current = Some(first);
            state.property_visible = true;
            position
        })?;
        info!("🏠 Showing search result #1 of {} (history #{})", results.len(), position);

        Ok(format!(
            "Found {} matching properties. Showing result #1 (viewing history #{}): {}",
            results.len(),
            position,
            description
        ))
    }

    fn show_previous(&self, args: &Value, cancel: &CancellationToken) -> RealtimeResult<String> {
        let index = match args.get("index") {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
            _ => None,
        };

        self.commit(cancel, |state| {
            let len = state.history.len();
            if len == 0 {
                return "No properties have been shown yet in this conversation.".to_string();
            }
            let Some(index) = index else {
                return format!("Please give the number of the property to show, from 1 to {}.", len);
            };

            let found = usize::try_from(index)
                .ok()
                .and_then(|i| state.history.get(i))
                .cloned();
            match found {
                Some(property) => {
                    let description = property.describe();
                    state.current = Some(property);
                    state.property_visible = true;
                    format!("Showing property #{} again: {}", index, description)
                }
                None => format!(
                    "There is no property #{}. {} properties have been shown so far; choose a number from 1 to {}.",
                    index, len, len
                ),
            }
        })
    }

    fn show_lead_form(&self, cancel: &CancellationToken) -> RealtimeResult<String> {
        self.commit(cancel, |state| {
            state.property_visible = false;
            state.lead_form_visible = true;
        })?;
        Ok("The contact form is now open. Ask the user for their name and phone number.".to_string())
    }

    fn hide_property(&self, cancel: &CancellationToken) -> RealtimeResult<String> {
        self.commit(cancel, |state| state.property_visible = false)?;
        Ok("The property card is hidden.".to_string())
    }

    /// Function declarations advertised to the backend at connection setup.
    pub fn declarations() -> Value {
        json!([{
            "functionDeclarations": [
                {
                    "name": TOOL_SEARCH,
                    "description": "Search available properties and show the best match to the user.",
                    "parameters": {
                        "type": "OBJECT",
                        "properties": {
                            "query": { "type": "STRING", "description": "What the user is looking for, including type and location." },
                            "property_type": { "type": "STRING", "description": "Property type such as villa or apartment." }
                        },
                        "required": ["query"]
                    }
                },
                {
                    "name": TOOL_SHOW_PREVIOUS,
                    "description": "Show a property that was already shown, by its 1-based position in the viewing history.",
                    "parameters": {
                        "type": "OBJECT",
                        "properties": {
                            "index": { "type": "INTEGER", "description": "1 is the first property shown." }
                        },
                        "required": ["index"]
                    }
                },
                {
                    "name": TOOL_SHOW_LEAD_FORM,
                    "description": "Open the contact form so the user can leave their details."
                },
                {
                    "name": TOOL_HIDE_PROPERTY,
                    "description": "Hide the property card."
                }
            ]
        }])
    }
}
