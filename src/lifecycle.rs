//! Lifecycle states of generations and the registration that tracks them.

use color_eyre::{eyre::eyre, Report};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of one registered generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
  Installing,
  Waiting,
  Activating,
  Active,
  Redundant,
}

impl LifecycleState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Installing => "installing",
      Self::Waiting => "waiting",
      Self::Activating => "activating",
      Self::Active => "active",
      Self::Redundant => "redundant",
    }
  }
}

impl fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for LifecycleState {
  type Err = Report;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "installing" => Ok(Self::Installing),
      "waiting" => Ok(Self::Waiting),
      "activating" => Ok(Self::Activating),
      "active" => Ok(Self::Active),
      "redundant" => Ok(Self::Redundant),
      other => Err(eyre!("Unknown lifecycle state '{}'", other)),
    }
  }
}

/// A version of the application together with its precache manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
  pub version: String,
  pub manifest: Vec<String>,
}

impl Release {
  pub fn new(version: impl Into<String>, manifest: Vec<String>) -> Self {
    Self {
      version: version.into(),
      manifest,
    }
  }
}

/// Notifications delivered to the host page about registration changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleNotice {
  /// A new version started installing
  UpdateFound { version: String },
  /// A version moved to a new state
  StateChange {
    version: String,
    state: LifecycleState,
  },
  /// Open pages are now controlled by this version
  ControllerChange { version: String },
}

/// Which release occupies each lifecycle slot of a scope.
///
/// Several releases may coexist transiently (old active, new waiting) until
/// an activation fires.
#[derive(Debug, Clone, Default)]
pub struct Registration {
  installing: Option<Release>,
  waiting: Option<Release>,
  active: Option<Release>,
  retired: Vec<String>,
  clients: usize,
}

impl Registration {
  /// Rebuild the registration from persisted slots.
  pub fn restore(active: Option<Release>, waiting: Option<Release>) -> Self {
    Self {
      active,
      waiting,
      ..Self::default()
    }
  }

  pub fn active(&self) -> Option<&Release> {
    self.active.as_ref()
  }

  pub fn waiting(&self) -> Option<&Release> {
    self.waiting.as_ref()
  }

  pub fn installing(&self) -> Option<&Release> {
    self.installing.as_ref()
  }

  pub fn clients(&self) -> usize {
    self.clients
  }

  pub fn attach_client(&mut self) {
    self.clients += 1;
  }

  /// Returns the number of clients still attached.
  pub fn detach_client(&mut self) -> usize {
    self.clients = self.clients.saturating_sub(1);
    self.clients
  }

  pub fn begin_install(&mut self, release: Release) {
    self.installing = Some(release);
  }

  /// Move the installing release to waiting, replacing any older waiting one.
  ///
  /// Returns the displaced waiting release, which becomes redundant.
  pub fn finish_install(&mut self) -> Option<Release> {
    let installed = self.installing.take()?;
    let version = installed.version.clone();
    let displaced = self
      .waiting
      .replace(installed)
      .filter(|old| old.version != version);
    if let Some(old) = &displaced {
      self.retired.push(old.version.clone());
    }
    displaced
  }

  pub fn abort_install(&mut self) {
    if let Some(release) = self.installing.take() {
      self.retired.push(release.version);
    }
  }

  /// Promote the waiting release. Returns (new active, previous active).
  pub fn promote(&mut self) -> Option<(Release, Option<Release>)> {
    let next = self.waiting.take()?;
    let previous = self.active.replace(next.clone());
    if let Some(old) = &previous {
      if old.version != next.version {
        self.retired.push(old.version.clone());
      }
    }
    self.retired.retain(|v| *v != next.version);
    Some((next, previous))
  }

  /// Forget everything but the active release.
  pub fn clear_pending(&mut self) {
    if let Some(waiting) = self.waiting.take() {
      self.retired.push(waiting.version);
    }
  }

  pub fn state_of(&self, version: &str) -> Option<LifecycleState> {
    let is = |slot: &Option<Release>| slot.as_ref().is_some_and(|r| r.version == version);

    if is(&self.active) {
      Some(LifecycleState::Active)
    } else if is(&self.waiting) {
      Some(LifecycleState::Waiting)
    } else if is(&self.installing) {
      Some(LifecycleState::Installing)
    } else if self.retired.iter().any(|v| v == version) {
      Some(LifecycleState::Redundant)
    } else {
      None
    }
  }
}
