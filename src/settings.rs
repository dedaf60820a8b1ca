//! Playback preferences and the other small bits of persisted user state.

use crate::error::Result;
use crate::store::KvStore;
use std::str::FromStr;
use std::sync::Arc;

const KEY_PLAY_MODE: &str = "playMode";
const KEY_PLAY_ORDER: &str = "playOrder";
const KEY_PLAY_SPEED: &str = "playSpeed";
const KEY_TIP_SHOWN: &str = "hasShownTip";
const KEY_REMEMBER_ME: &str = "rememberMe";
const KEY_EMAIL: &str = "email";
const KEY_PASSWORD: &str = "password";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackSpeed {
    Half,
    #[default]
    Normal,
    OneAndHalf,
    Double,
}

impl FromStr for PlaybackSpeed {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "0.5x" => Ok(PlaybackSpeed::Half),
            "1x" => Ok(PlaybackSpeed::Normal),
            "1.5x" => Ok(PlaybackSpeed::OneAndHalf),
            "2x" => Ok(PlaybackSpeed::Double),
            other => Err(format!("unknown speed '{}' (0.5x, 1x, 1.5x or 2x)", other)),
        }
    }
}

impl PlaybackSpeed {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybackSpeed::Half => "0.5x",
            PlaybackSpeed::Normal => "1x",
            PlaybackSpeed::OneAndHalf => "1.5x",
            PlaybackSpeed::Double => "2x",
        }
    }

    pub fn rate(&self) -> f32 {
        match self {
            PlaybackSpeed::Half => 0.5,
            PlaybackSpeed::Normal => 1.0,
            PlaybackSpeed::OneAndHalf => 1.5,
            PlaybackSpeed::Double => 2.0,
        }
    }
}

/// What happens when a video reaches its end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopMode {
    /// Replay the same video.
    #[default]
    Single,
    /// Advance to the next video.
    Auto,
}

impl FromStr for LoopMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "single" => Ok(LoopMode::Single),
            "auto" => Ok(LoopMode::Auto),
            other => Err(format!("unknown loop mode '{}' (single or auto)", other)),
        }
    }
}

impl LoopMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopMode::Single => "single",
            LoopMode::Auto => "auto",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderMode {
    #[default]
    Sequential,
    Random,
}

impl FromStr for OrderMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "order" => Ok(OrderMode::Sequential),
            "random" => Ok(OrderMode::Random),
            other => Err(format!("unknown play order '{}' (order or random)", other)),
        }
    }
}

impl OrderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderMode::Sequential => "order",
            OrderMode::Random => "random",
        }
    }

    pub fn is_random(&self) -> bool {
        matches!(self, OrderMode::Random)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaybackSettings {
    pub speed: PlaybackSpeed,
    pub loop_mode: LoopMode,
    pub order: OrderMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RememberedLogin {
    pub email: String,
    pub password: String,
}

/// Explicit load/save access to persisted preferences.
#[derive(Clone)]
pub struct SettingsStore {
    store: Arc<KvStore>,
}

impl SettingsStore {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self { store }
    }

    /// Saved preferences. Missing or unreadable values fall back to 1x,
    /// single loop and sequential order.
    pub fn load(&self) -> PlaybackSettings {
        PlaybackSettings {
            speed: self.read(KEY_PLAY_SPEED),
            loop_mode: self.read(KEY_PLAY_MODE),
            order: self.read(KEY_PLAY_ORDER),
        }
    }

    fn read<T: FromStr + Default>(&self, key: &str) -> T {
        self.store
            .get(key)
            .and_then(|value| value.parse().ok())
            .unwrap_or_default()
    }

    pub fn save(&self, settings: &PlaybackSettings) -> Result<()> {
        self.set_speed(settings.speed)?;
        self.set_loop_mode(settings.loop_mode)?;
        self.set_order_mode(settings.order)
    }

    pub fn set_speed(&self, speed: PlaybackSpeed) -> Result<()> {
        self.store.set(KEY_PLAY_SPEED, speed.as_str())
    }

    pub fn set_loop_mode(&self, mode: LoopMode) -> Result<()> {
        self.store.set(KEY_PLAY_MODE, mode.as_str())
    }

    pub fn set_order_mode(&self, order: OrderMode) -> Result<()> {
        self.store.set(KEY_PLAY_ORDER, order.as_str())
    }

    /// Whether the first-run gesture tip has been shown.
    pub fn tip_shown(&self) -> bool {
        self.store.get(KEY_TIP_SHOWN).as_deref() == Some("true")
    }

    pub fn mark_tip_shown(&self) -> Result<()> {
        self.store.set(KEY_TIP_SHOWN, "true")
    }

    pub fn remember_login(&self, email: &str, password: &str) -> Result<()> {
        self.store.set(KEY_EMAIL, email)?;
        self.store.set(KEY_PASSWORD, password)?;
        self.store.set(KEY_REMEMBER_ME, "true")
    }

    pub fn forget_login(&self) -> Result<()> {
        self.store.remove(KEY_EMAIL)?;
        self.store.remove(KEY_PASSWORD)?;
        self.store.set(KEY_REMEMBER_ME, "false")
    }

    pub fn remembered_login(&self) -> Option<RememberedLogin> {
        if self.store.get(KEY_REMEMBER_ME).as_deref() != Some("true") {
            return None;
        }
        Some(RememberedLogin {
            email: self.store.get(KEY_EMAIL)?,
            password: self.store.get(KEY_PASSWORD)?,
        })
    }

    /// Wipe all persisted state (logout).
    pub fn clear_all(&self) -> Result<()> {
        self.store.clear()
    }
}
