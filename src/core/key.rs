//! Key management for encrypted archives
//!
//! A [`PromptingKeyManager`] hands out one [`PromptingKeyProvider`] per
//! protected resource (the mount point of an encrypted archive). Providers
//! remember the key once the user entered it and ask the [`KeyPrompt`] only
//! when there is none, or when the driver reports the last one as invalid.
//!
//! Successive invalid read keys are throttled: a provider waits until the
//! configured retry delay has passed since its previous failed attempt
//! completed before it prompts again.

use crate::core::error::KeyError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Minimum delay between two invalid read-key attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(3000);

pub type KeyResult<K> = std::result::Result<K, KeyError>;

pub trait KeyProvider<K>: Send + Sync {
    /// Key for encrypting a new or modified resource.
    fn key_for_writing(&self) -> KeyResult<K>;

    /// Key for decrypting the resource. `invalid` tells that the key
    /// returned by the previous call did not work.
    fn key_for_reading(&self, invalid: bool) -> KeyResult<K>;

    /// Replaces the current key. `None` resets the provider.
    fn set_key(&self, key: Option<K>);

    /// Allows prompting again after the user cancelled.
    fn reset_cancelled_key(&self);
}

/// User interface asking for keys.
pub trait KeyPrompt<K>: Send + Sync {
    fn prompt_for_writing(&self, resource: &str) -> KeyResult<K>;

    fn prompt_for_reading(&self, resource: &str, invalid: bool) -> KeyResult<K>;
}

/// Prompt for environments without a user: every request fails.
pub struct NoPrompt;

impl<K> KeyPrompt<K> for NoPrompt {
    fn prompt_for_writing(&self, resource: &str) -> KeyResult<K> {
        Err(KeyError::Unavailable(resource.to_string()))
    }

    fn prompt_for_reading(&self, resource: &str, _invalid: bool) -> KeyResult<K> {
        Err(KeyError::Unavailable(resource.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Reset,
    Set,
    Cancelled,
}

struct ProviderState<K> {
    state: KeyState,
    key: Option<K>,
    /// Completion of the previous invalid read-key attempt.
    last_invalid: Option<Instant>,
}

pub struct PromptingKeyProvider<K> {
    resource: Mutex<String>,
    prompt: Arc<dyn KeyPrompt<K>>,
    retry_delay: Duration,
    state: Mutex<ProviderState<K>>,
}

impl<K: Clone + Send> PromptingKeyProvider<K> {
    pub fn new(resource: impl Into<String>, prompt: Arc<dyn KeyPrompt<K>>) -> Self {
        Self::with_retry_delay(resource, prompt, DEFAULT_RETRY_DELAY)
    }

    pub fn with_retry_delay(
        resource: impl Into<String>,
        prompt: Arc<dyn KeyPrompt<K>>,
        retry_delay: Duration,
    ) -> Self {
        PromptingKeyProvider {
            resource: Mutex::new(resource.into()),
            prompt,
            retry_delay,
            state: Mutex::new(ProviderState {
                state: KeyState::Reset,
                key: None,
                last_invalid: None,
            }),
        }
    }

    pub fn resource(&self) -> String {
        self.resource.lock().clone()
    }

    pub fn state(&self) -> KeyState {
        self.state.lock().state
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    fn remember(&self, state: &mut ProviderState<K>, result: &KeyResult<K>) {
        match result {
            Ok(key) => {
                state.key = Some(key.clone());
                state.state = KeyState::Set;
            }
            Err(KeyError::Cancelled(_)) => {
                state.key = None;
                state.state = KeyState::Cancelled;
                info!("Key prompting cancelled for {}", self.resource());
            }
            Err(_) => {
                state.key = None;
                state.state = KeyState::Reset;
            }
        }
    }
}

impl<K: Clone + Send> KeyProvider<K> for PromptingKeyProvider<K> {
    fn key_for_writing(&self) -> KeyResult<K> {
        let mut state = self.state.lock();
        match state.state {
            KeyState::Set => {
                if let Some(key) = &state.key {
                    return Ok(key.clone());
                }
            }
            KeyState::Cancelled => return Err(KeyError::Cancelled(self.resource())),
            KeyState::Reset => {}
        }
        let result = self.prompt.prompt_for_writing(&self.resource());
        self.remember(&mut state, &result);
        result
    }

    fn key_for_reading(&self, invalid: bool) -> KeyResult<K> {
        let mut state = self.state.lock();
        if !invalid {
            match state.state {
                KeyState::Set => {
                    if let Some(key) = &state.key {
                        return Ok(key.clone());
                    }
                }
                KeyState::Cancelled => return Err(KeyError::Cancelled(self.resource())),
                KeyState::Reset => {}
            }
            let result = self.prompt.prompt_for_reading(&self.resource(), false);
            self.remember(&mut state, &result);
            return result;
        }

        if let Some(last) = state.last_invalid {
            let elapsed = last.elapsed();
            if elapsed < self.retry_delay {
                let wait = self.retry_delay - elapsed;
                debug!("Throttling key retry for {} by {:?}", self.resource(), wait);
                thread::sleep(wait);
            }
        }
        state.state = KeyState::Reset;
        state.key = None;
        let result = self.prompt.prompt_for_reading(&self.resource(), true);
        self.remember(&mut state, &result);
        state.last_invalid = Some(Instant::now());
        result
    }

    fn set_key(&self, key: Option<K>) {
        let mut state = self.state.lock();
        state.state = if key.is_some() {
            KeyState::Set
        } else {
            KeyState::Reset
        };
        state.key = key;
    }

    fn reset_cancelled_key(&self) {
        let mut state = self.state.lock();
        if state.state == KeyState::Cancelled {
            state.state = KeyState::Reset;
        }
    }
}

/// Keeps one provider per resource.
pub struct PromptingKeyManager<K> {
    prompt: Arc<dyn KeyPrompt<K>>,
    retry_delay: Duration,
    providers: Mutex<HashMap<String, Arc<PromptingKeyProvider<K>>>>,
}

impl<K: Clone + Send + 'static> PromptingKeyManager<K> {
    pub fn new(prompt: Arc<dyn KeyPrompt<K>>) -> Self {
        Self::with_retry_delay(prompt, DEFAULT_RETRY_DELAY)
    }

    pub fn with_retry_delay(prompt: Arc<dyn KeyPrompt<K>>, retry_delay: Duration) -> Self {
        PromptingKeyManager {
            prompt,
            retry_delay,
            providers: Mutex::new(HashMap::new()),
        }
    }

    /// Provider for `resource`, created on first use.
    pub fn provider(&self, resource: &str) -> Arc<PromptingKeyProvider<K>> {
        self.providers
            .lock()
            .entry(resource.to_string())
            .or_insert_with(|| {
                Arc::new(PromptingKeyProvider::with_retry_delay(
                    resource,
                    self.prompt.clone(),
                    self.retry_delay,
                ))
            })
            .clone()
    }

    pub fn remove_provider(&self, resource: &str) -> Option<Arc<PromptingKeyProvider<K>>> {
        self.providers.lock().remove(resource)
    }

    /// Moves the provider of `from` to `to`, e.g. after the archive file was
    /// renamed. Returns false if `from` has no provider.
    ///
    /// # Panics
    ///
    /// If `to` already has a provider.
    pub fn move_provider(&self, from: &str, to: &str) -> bool {
        let mut providers = self.providers.lock();
        assert!(
            !providers.contains_key(to),
            "resource {} already has a key provider",
            to
        );
        match providers.remove(from) {
            Some(provider) => {
                *provider.resource.lock() = to.to_string();
                providers.insert(to.to_string(), provider);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.providers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.lock().is_empty()
    }
}
