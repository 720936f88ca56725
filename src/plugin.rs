//! Plugin lifecycle: the search command, the settings command and the
//! result view they drive.
//!
//! A disassembler integration implements [`Host`] and owns one
//! [`SearchPlugin`]. It calls [`SearchPlugin::start`] when the plugin is
//! loaded, [`SearchPlugin::invoke`] from its action handlers and
//! [`SearchPlugin::stop`] on unload.

use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;

use crate::classify::classify;
use crate::compiler::{self, normalize_pattern};
use crate::config::Config;
use crate::credentials::{CredentialStore, API_KEY};
use crate::format::{Drilldown, ResultView};
use crate::logging::{log_debug, log_error, log_info, log_warn, Logger};
use crate::search::{HttpTransport, Notifier, SearchClient, SearchEncoding};
use crate::{Address, AddressRange, InstructionSource, PluginError};

/// Internal action id
pub const ACTION_NAME: &str = "unpacme_search";
/// Menu and popup label
pub const ACTION_LABEL: &str = "UnpacMe Byte Search";
/// Default hotkey
pub const ACTION_HOTKEY: &str = "Shift-Alt-s";
/// Menu the action is attached to
pub const MENU_PATH: &str = "Edit/Plugins/";
/// Title of the results window
pub const RESULTS_TITLE: &str = "UnpacMe Search";

/// Shown when a search is attempted without a key
pub const MISSING_KEY_WARNING: &str = "An UnpacMe API key is required to search.";

/// An action the host should expose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionDesc {
    pub name: String,
    pub label: String,
    pub hotkey: String,
    pub tooltip: String,
}

impl ActionDesc {
    /// The byte search action
    pub fn search() -> Self {
        Self {
            name: ACTION_NAME.to_string(),
            label: ACTION_LABEL.to_string(),
            hotkey: ACTION_HOTKEY.to_string(),
            tooltip: ACTION_LABEL.to_string(),
        }
    }
}

/// Contents of the settings dialog.
#[derive(Clone, PartialEq, Eq)]
pub struct SettingsForm {
    /// Current key, empty if none is stored
    pub api_key: String,
    pub config: Config,
}

impl fmt::Debug for SettingsForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingsForm")
            .field("api_key", &if self.api_key.is_empty() { "" } else { "<set>" })
            .field("config", &self.config)
            .finish()
    }
}

/// What the plugin needs from the disassembler it runs in.
pub trait Host: Notifier {
    /// Decoded view of the current program
    fn source(&self) -> &dyn InstructionSource;

    /// Raw selection bounds; either may be a sentinel
    fn selection(&self) -> (Address, Address);

    /// Write a line to the output window
    fn message(&self, text: &str);

    /// Register an action; returns false if the host refused it
    fn register_action(&self, action: &ActionDesc) -> bool;

    /// Remove a registered action
    fn unregister_action(&self, name: &str);

    /// Add an action to a main-menu path
    fn attach_to_menu(&self, path: &str, action: &str);

    /// Add an action to the disassembly view's context menu
    fn attach_to_popup(&self, action: &str, label: &str);

    /// Let the user review the pattern (one unit per line) next to the
    /// transcript. `None` means cancelled.
    fn preview(&self, pattern: &str, transcript: &str) -> Option<String>;

    /// Let the user edit settings. `None` means cancelled.
    fn edit_settings(&self, form: SettingsForm) -> Option<SettingsForm>;

    /// Open the results window
    fn show_results(&self, title: &str, view: &ResultView);

    /// Close the results window
    fn close_results(&self);

    /// Put text on the clipboard
    fn set_clipboard(&self, text: &str);
}

/// Commands the host can trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Compile the selection and search for it
    Search,
    /// Open the settings dialog
    Settings,
    /// Copy the current results' search term
    CopyPattern,
}

/// The byte search plugin.
pub struct SearchPlugin<H: Host> {
    host: H,
    log: Logger,
    config_path: PathBuf,
    config: Config,
    credentials: Box<dyn CredentialStore>,
    transport: Rc<dyn HttpTransport>,
    client: Option<SearchClient>,
    results: Option<ResultView>,
    actions: Vec<String>,
}

impl<H: Host> SearchPlugin<H> {
    /// Create a plugin; nothing touches the host until [`start`](Self::start).
    pub fn new(
        host: H,
        log: Logger,
        config_path: impl Into<PathBuf>,
        credentials: Box<dyn CredentialStore>,
        transport: Rc<dyn HttpTransport>,
    ) -> Self {
        Self {
            host,
            log,
            config_path: config_path.into(),
            config: Config::default(),
            credentials,
            transport,
            client: None,
            results: None,
            actions: Vec::new(),
        }
    }

    /// The host
    pub fn host(&self) -> &H {
        &self.host
    }

    /// Active settings
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The plugin logger
    pub fn logger(&self) -> &Logger {
        &self.log
    }

    /// The open result view, if any
    pub fn results(&self) -> Option<&ResultView> {
        self.results.as_ref()
    }

    fn banner() -> String {
        format!(
            "\n##################\nUnpacMe Search\nVersion: {}\n##################\n",
            env!("CARGO_PKG_VERSION")
        )
    }

    /// Load settings and register the search action.
    ///
    /// On a first run the settings dialog is shown before the action is
    /// registered. Failures are reported to the user and returned.
    pub fn start(&mut self) -> Result<(), PluginError> {
        self.try_start().map_err(|e| {
            log_error!(self.log, "Error initializing UnpacmeSearchPlugin {}", e);
            self.host.warning(&format!("Error initializing UnpacmeSearchPlugin {}", e));
            e
        })
    }

    fn try_start(&mut self) -> Result<(), PluginError> {
        self.host.message(&Self::banner());

        log_debug!(self.log, "Loading config..");
        let first_run = match Config::load_from(&self.config_path) {
            Ok(loaded) => {
                self.config = loaded.config;
                loaded.first_run
            }
            Err(e) => {
                log_warn!(self.log, "{}; using defaults", e);
                self.host.warning(&format!("Could not load settings, using defaults: {}", e));
                self.config = Config::default();
                false
            }
        };
        self.config.apply_level(&self.log);

        if first_run {
            log_info!(self.log, "No config file!");
            log_info!(self.log, "Running default configuration");
            self.edit_settings()?;
        }

        log_debug!(self.log, "== UnpacMe Search Config ==");
        log_debug!(self.log, " -> loglevel: {}", self.config.loglevel);
        log_debug!(self.log, " -> preview: {}", self.config.preview);
        log_debug!(self.log, " -> auto: {}", self.config.auto);
        log_debug!(self.log, " -> goodware: {}", self.config.goodware);

        let action = ActionDesc::search();
        if !self.host.register_action(&action) {
            return Err(PluginError::Host(format!("failed to register action {}", action.name)));
        }
        self.actions.push(action.name.clone());
        self.host.attach_to_menu(MENU_PATH, &action.name);
        self.host.attach_to_popup(&action.name, &action.label);

        log_info!(self.log, "UnpacmeSearchPlugin initialized.");
        Ok(())
    }

    /// Run a command. Failures are reported to the user and returned.
    pub fn invoke(&mut self, command: Command) -> Result<(), PluginError> {
        let outcome = match command {
            Command::Search => self.run_search(),
            Command::Settings => self.edit_settings(),
            Command::CopyPattern => {
                self.copy_pattern();
                Ok(())
            }
        };

        outcome.map_err(|e| {
            log_error!(self.log, "{}", e);
            self.host.warning(&e.to_string());
            e
        })
    }

    /// Unregister everything registered by [`start`](Self::start)
    pub fn stop(&mut self) {
        for name in self.actions.drain(..) {
            self.host.unregister_action(&name);
        }
    }

    /// What activating a cell of the open results does
    pub fn activate(&self, row: usize, col: usize) -> Option<Drilldown> {
        self.results.as_ref()?.activate(row, col, &self.log)
    }

    fn copy_pattern(&self) {
        match &self.results {
            Some(view) => {
                self.host.set_clipboard(view.copy_pattern());
                log_info!(self.log, "Text copied to clipboard: {}", view.copy_pattern());
            }
            None => log_warn!(self.log, "No search results to copy from"),
        }
    }

    fn run_search(&mut self) -> Result<(), PluginError> {
        let (start, end) = self.host.selection();
        let range = match AddressRange::new(start, end) {
            Ok(range) => range,
            Err(e) => {
                log_debug!(self.log, "{}", e);
                self.host.warning(&e.to_string());
                return Ok(());
            }
        };

        if !self.ensure_client()? {
            return Ok(());
        }

        let compiled = compiler::compile(range, self.host.source(), self.config.auto, &self.log)?;

        let pattern = if self.config.preview {
            match self.host.preview(&compiled.preview_text(), compiled.transcript()) {
                Some(edited) => normalize_pattern(&edited),
                None => {
                    log_debug!(self.log, "Search cancelled");
                    return Ok(());
                }
            }
        } else {
            compiled.pattern()
        };

        if pattern.is_empty() {
            self.host.warning("Nothing to search for.");
            return Ok(());
        }

        let client = match &self.client {
            Some(client) => client,
            None => return Ok(()),
        };
        let result = match client.search(
            &self.host,
            &self.log,
            &pattern,
            SearchEncoding::Hex,
            self.config.goodware,
        ) {
            Some(result) => result,
            None => return Ok(()),
        };

        let classified = classify(result);
        log_info!(self.log, "{:?}", classified.classification_map);
        log_info!(self.log, "{:?}", classified.label_map);

        if self.results.take().is_some() {
            self.host.close_results();
        }
        let view = ResultView::new(&pattern, &classified);
        self.host.show_results(RESULTS_TITLE, &view);
        self.results = Some(view);

        if let Some(warning) = &classified.result.warning {
            self.host.warning(warning);
        }
        Ok(())
    }

    /// Build the search client on first use.
    ///
    /// Returns false, after telling the user, if no key could be obtained.
    fn ensure_client(&mut self) -> Result<bool, PluginError> {
        if self.client.is_some() {
            return Ok(true);
        }

        let mut key = self.stored_key();
        if key.is_none() {
            log_warn!(self.log, "No API Key found!");
            self.edit_settings()?;
            key = self.stored_key();
        }

        match key {
            Some(key) => {
                self.client = Some(SearchClient::new(&key, Rc::clone(&self.transport))?);
                Ok(true)
            }
            None => {
                self.host.warning(MISSING_KEY_WARNING);
                Ok(false)
            }
        }
    }

    /// Stored, non-empty API key. Store failures count as no key.
    fn stored_key(&self) -> Option<String> {
        match self.credentials.get(API_KEY) {
            Ok(key) => key.filter(|k| !k.trim().is_empty()),
            Err(e) => {
                log_error!(self.log, "{}", e);
                None
            }
        }
    }

    fn edit_settings(&mut self) -> Result<(), PluginError> {
        log_debug!(self.log, "Getting API Key");
        let api_key = self.stored_key();
        if api_key.is_none() {
            log_warn!(self.log, "No API Key found!");
        }

        let form = SettingsForm {
            api_key: api_key.unwrap_or_default(),
            config: self.config.clone(),
        };

        let updated = match self.host.edit_settings(form) {
            Some(updated) => updated,
            None => {
                log_debug!(self.log, "Config dialog closed");
                return Ok(());
            }
        };

        let key = updated.api_key.trim();
        if !key.is_empty() {
            self.credentials.set(API_KEY, key)?;
            self.client = None;
        }

        log_info!(self.log, "Saving config");
        self.config = updated.config;
        self.config.save_to(&self.config_path)?;
        self.config.apply_level(&self.log);
        Ok(())
    }
}

impl<H: Host> fmt::Debug for SearchPlugin<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchPlugin")
            .field("config_path", &self.config_path)
            .field("config", &self.config)
            .field("has_client", &self.client.is_some())
            .field("actions", &self.actions)
            .finish_non_exhaustive()
    }
}
