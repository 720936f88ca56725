use std::cell::{Cell, RefCell};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use unpacme_search::{
    classify::classify,
    compiler,
    config::{Config, LOG_LEVELS},
    credentials::{CredentialStore, FileCredentialStore, API_KEY},
    decoder::X86Source,
    format::{OutputFormat, ResultView},
    logging::{self, Logger},
    parser::{BinaryImage, GoblinParser},
    plugin::{ActionDesc, Command, Host, SearchPlugin, SettingsForm, RESULTS_TITLE},
    search::{HttpTransport, Notifier, ReqwestTransport, SearchClient, SearchEncoding},
    Address, AddressRange, InstructionSource, PluginError,
};

#[derive(Parser)]
#[command(name = "unpacme-search")]
#[command(version, about = "Turn disassembly into wildcarded byte patterns and search them on UnpacMe", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the pattern and transcript for a range of a binary
    Compile(CompileCommand),
    /// Compile a range (or take a literal pattern) and search UnpacMe for it
    Search(SearchCommand),
    /// Show or update settings and the stored API key
    Config(ConfigCommand),
}

/// Which bytes of a binary to compile
#[derive(Args)]
struct Selection {
    /// First address (hex with 0x, or decimal); defaults to the entry point
    #[arg(short, long, value_parser = parse_address)]
    start: Option<Address>,

    /// Address just past the selection
    #[arg(short, long, value_parser = parse_address, conflicts_with = "length")]
    end: Option<Address>,

    /// Bytes to select when --end is not given
    #[arg(short, long, default_value_t = 32)]
    length: u64,

    /// Treat the file as raw x86 code
    #[arg(long)]
    raw: bool,

    /// Load address of a raw file
    #[arg(long, value_parser = parse_address, default_value = "0")]
    base: Address,

    /// Bitness of a raw file (16, 32 or 64)
    #[arg(long, default_value_t = 64)]
    bitness: u32,
}

impl Selection {
    fn load(&self, file: &Path) -> Result<BinaryImage> {
        let data = fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
        if self.raw {
            if !matches!(self.bitness, 16 | 32 | 64) {
                bail!("Unsupported bitness {}", self.bitness);
            }
            return Ok(BinaryImage::raw(&data, self.base, self.bitness));
        }
        GoblinParser::new()
            .parse(&data)
            .with_context(|| format!("Failed to load {}", file.display()))
    }

    fn bounds(&self, image: &BinaryImage) -> Result<(Address, Address)> {
        let start = match self.start.or(image.entry_point) {
            Some(start) => start,
            None => bail!("No --start given and the file has no entry point"),
        };
        let end = self.end.unwrap_or_else(|| start.saturating_add(self.length));
        Ok((start, end))
    }
}

#[derive(Args)]
struct CompileCommand {
    /// Path to an ELF, PE or Mach-O file, or a raw blob with --raw
    file: PathBuf,

    #[command(flatten)]
    selection: Selection,

    /// Keep position-dependent operand bytes instead of wildcarding them
    #[arg(long)]
    no_auto: bool,
}

impl CompileCommand {
    fn execute(&self) -> Result<()> {
        let image = self.selection.load(&self.file)?;
        let (start, end) = self.selection.bounds(&image)?;
        let range = AddressRange::new(start, end)?;

        let source = X86Source::new(&image);
        let log = Logger::new("UnpacMeSearch");
        let compiled = compiler::compile(range, &source, !self.no_auto, &log)?;

        print!("{}", compiled.transcript());
        println!();
        println!("{}", compiled.pattern());
        if compiled.is_truncated() {
            log::warn!("Stopped after {} units; the pattern covers only part of {}", compiler::MAX_STEPS, range);
        }
        Ok(())
    }
}

#[derive(Args)]
struct SearchCommand {
    /// Binary to compile a range from; omit when using --pattern
    file: Option<PathBuf>,

    #[command(flatten)]
    selection: Selection,

    /// Search this term instead of compiling a range
    #[arg(short, long, conflicts_with = "file")]
    pattern: Option<String>,

    /// How the service reads --pattern
    #[arg(long, value_enum, default_value_t = SearchEncoding::Hex)]
    encoding: SearchEncoding,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

impl SearchCommand {
    fn execute(&self) -> Result<()> {
        let config_path = Config::default_path()?;
        let credentials = FileCredentialStore::open_default()?;
        let transport: Rc<dyn HttpTransport> = Rc::new(ReqwestTransport::new()?);

        if let Some(pattern) = &self.pattern {
            return self.search_literal(pattern, &config_path, &credentials, transport);
        }
        let file = match &self.file {
            Some(file) => file,
            None => bail!("Give a file to compile or a --pattern to search"),
        };

        let image = self.selection.load(file)?;
        let bounds = self.selection.bounds(&image)?;
        let host = CliHost::new(X86Source::new(&image), bounds, self.format);

        let mut plugin = SearchPlugin::new(
            host,
            Logger::new("UnpacMeSearch"),
            config_path,
            Box::new(credentials),
            transport,
        );
        plugin.start().map_err(|_| quiet_exit())?;
        let outcome = plugin.invoke(Command::Search);
        plugin.stop();
        outcome.map_err(|_| quiet_exit())
    }

    fn search_literal(
        &self,
        pattern: &str,
        config_path: &Path,
        credentials: &FileCredentialStore,
        transport: Rc<dyn HttpTransport>,
    ) -> Result<()> {
        let config = Config::load_from(config_path)?.config;
        let log = Logger::new("UnpacMeSearch");
        config.apply_level(&log);

        let key = match credentials.get(API_KEY)? {
            Some(key) if !key.trim().is_empty() => key,
            _ => bail!("No API key stored; run `unpacme-search config --api-key <KEY>` first"),
        };
        let client = SearchClient::new(&key, transport)?;

        let image = BinaryImage::raw(&[], 0, 64);
        let ui = CliHost::new(X86Source::new(&image), (0, 0), self.format);
        let result = match client.search(&ui, &log, pattern, self.encoding, config.goodware) {
            Some(result) => result,
            None => return Err(quiet_exit()),
        };

        let classified = classify(result);
        let view = ResultView::new(pattern, &classified);
        ui.show_results(RESULTS_TITLE, &view);
        if let Some(warning) = &classified.result.warning {
            ui.warning(warning);
        }
        Ok(())
    }
}

#[derive(Args)]
struct ConfigCommand {
    /// Store this API key
    #[arg(long)]
    api_key: Option<String>,

    /// Log level
    #[arg(long, value_parser = clap::builder::PossibleValuesParser::new(LOG_LEVELS))]
    loglevel: Option<String>,

    /// Show the pattern for review before searching
    #[arg(long)]
    preview: Option<bool>,

    /// Wildcard position-dependent operands
    #[arg(long)]
    auto: Option<bool>,

    /// Also search the goodware repository
    #[arg(long)]
    goodware: Option<bool>,
}

impl ConfigCommand {
    fn has_changes(&self) -> bool {
        self.api_key.is_some()
            || self.loglevel.is_some()
            || self.preview.is_some()
            || self.auto.is_some()
            || self.goodware.is_some()
    }

    fn apply(&self, mut form: SettingsForm) -> SettingsForm {
        if let Some(key) = &self.api_key {
            form.api_key = key.clone();
        }
        if let Some(level) = &self.loglevel {
            form.config.loglevel = level.clone();
        }
        if let Some(preview) = self.preview {
            form.config.preview = preview;
        }
        if let Some(auto) = self.auto {
            form.config.auto = auto;
        }
        if let Some(goodware) = self.goodware {
            form.config.goodware = goodware;
        }
        form
    }

    fn execute(self) -> Result<()> {
        let config_path = Config::default_path()?;
        let credentials = FileCredentialStore::open_default()?;

        if !self.has_changes() {
            let loaded = Config::load_from(&config_path)?;
            let key_set = credentials.get(API_KEY)?.is_some_and(|k| !k.trim().is_empty());
            println!("Settings file: {}", config_path.display());
            if loaded.first_run {
                println!("  (not created yet, showing defaults)");
            }
            println!("  loglevel: {}", loaded.config.loglevel);
            println!("  preview:  {}", loaded.config.preview);
            println!("  auto:     {}", loaded.config.auto);
            println!("  goodware: {}", loaded.config.goodware);
            println!("API key:    {}", if key_set { "stored" } else { "not set" });
            return Ok(());
        }

        let image = BinaryImage::raw(&[], 0, 64);
        let mut host = CliHost::new(X86Source::new(&image), (0, 0), OutputFormat::Text);
        host.settings = RefCell::new(Some(self));

        let mut plugin = SearchPlugin::new(
            host,
            Logger::new("UnpacMeSearch"),
            config_path.clone(),
            Box::new(credentials),
            Rc::new(ReqwestTransport::new()?),
        );
        save_settings(&mut plugin).map_err(|_| quiet_exit())?;

        println!("Settings saved to {}", config_path.display());
        Ok(())
    }
}

/// Apply the host's pending settings through the plugin.
///
/// On a first run `start` already shows the settings dialog, which takes the
/// pending changes; the explicit settings command only runs if they are left.
fn save_settings(plugin: &mut SearchPlugin<CliHost<'_>>) -> Result<(), PluginError> {
    plugin.start()?;
    if plugin.host().settings.borrow().is_some() {
        plugin.invoke(Command::Settings)?;
    }
    plugin.stop();
    Ok(())
}

/// Terminal stand-in for a disassembler host.
struct CliHost<'a> {
    source: X86Source<'a>,
    selection: (Address, Address),
    format: OutputFormat,
    /// Answer for the next settings dialog
    settings: RefCell<Option<ConfigCommand>>,
    /// Settings dialogs shown so far
    prompts: Cell<usize>,
}

impl<'a> CliHost<'a> {
    fn new(source: X86Source<'a>, selection: (Address, Address), format: OutputFormat) -> Self {
        Self {
            source,
            selection,
            format,
            settings: RefCell::new(None),
            prompts: Cell::new(0),
        }
    }
}

impl Notifier for CliHost<'_> {
    fn warning(&self, text: &str) {
        eprintln!("Warning: {}", text);
    }

    fn show_wait_box(&self, text: &str) {
        log::info!("{}", text);
    }

    fn replace_wait_box(&self, text: &str) {
        log::info!("{}", text);
    }

    fn hide_wait_box(&self) {}
}

impl Host for CliHost<'_> {
    fn source(&self) -> &dyn InstructionSource {
        &self.source
    }

    fn selection(&self) -> (Address, Address) {
        self.selection
    }

    fn message(&self, text: &str) {
        eprintln!("{}", text);
    }

    fn register_action(&self, action: &ActionDesc) -> bool {
        log::debug!("Registered {} ({})", action.name, action.hotkey);
        true
    }

    fn unregister_action(&self, name: &str) {
        log::debug!("Unregistered {}", name);
    }

    fn attach_to_menu(&self, _path: &str, _action: &str) {}

    fn attach_to_popup(&self, _action: &str, _label: &str) {}

    // No editor on a terminal: show what will be sent and send it as is
    fn preview(&self, pattern: &str, transcript: &str) -> Option<String> {
        eprint!("{}", transcript);
        eprintln!();
        Some(pattern.to_string())
    }

    fn edit_settings(&self, form: SettingsForm) -> Option<SettingsForm> {
        self.prompts.set(self.prompts.get() + 1);
        match self.settings.borrow_mut().take() {
            Some(changes) => Some(changes.apply(form)),
            None => {
                eprintln!("No settings given; run `unpacme-search config --api-key <KEY>` to set up");
                None
            }
        }
    }

    fn show_results(&self, title: &str, view: &ResultView) {
        match self.format.get_formatter().format(view) {
            Ok(text) => {
                if self.format == OutputFormat::Text {
                    println!("{}", title);
                }
                print!("{}", text);
            }
            Err(e) => log::error!("{}", e),
        }
    }

    fn close_results(&self) {}

    fn set_clipboard(&self, text: &str) {
        println!("{}", text);
    }
}

/// Parse `0x`-prefixed hex or decimal
fn parse_address(s: &str) -> Result<Address, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => Address::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address '{}': {}", s, e))
}

/// Marker error for failures the user has already been told about
#[derive(Debug, thiserror::Error)]
#[error("")]
struct AlreadyReported;

fn quiet_exit() -> anyhow::Error {
    AlreadyReported.into()
}

fn main() -> Result<()> {
    logging::env_logger_builder().init();

    let cli = Cli::parse();

    let outcome = match cli.command {
        Commands::Compile(cmd) => cmd.execute(),
        Commands::Search(cmd) => cmd.execute(),
        Commands::Config(cmd) => cmd.execute(),
    };

    match outcome {
        Err(e) if e.is::<AlreadyReported>() => std::process::exit(1),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use unpacme_search::config::CONFIG_FILE_NAME;

    fn changes() -> ConfigCommand {
        ConfigCommand {
            api_key: Some("new-key".into()),
            loglevel: Some("DEBUG".into()),
            preview: None,
            auto: None,
            goodware: Some(false),
        }
    }

    fn settings_plugin<'a>(image: &'a BinaryImage, dir: &Path) -> SearchPlugin<CliHost<'a>> {
        let host = CliHost::new(X86Source::new(image), (0, 0), OutputFormat::Text);
        *host.settings.borrow_mut() = Some(changes());
        SearchPlugin::new(
            host,
            Logger::with_sink("UnpacMeSearch", |_, _| {}),
            dir.join(CONFIG_FILE_NAME),
            Box::new(FileCredentialStore::new(dir.join("credentials.json"))),
            Rc::new(ReqwestTransport::new().unwrap()),
        )
    }

    #[test]
    fn test_first_run_config_prompts_once() {
        let dir = tempdir().unwrap();
        let image = BinaryImage::raw(&[], 0, 64);
        let mut plugin = settings_plugin(&image, dir.path());

        save_settings(&mut plugin).unwrap();

        assert_eq!(plugin.host().prompts.get(), 1);
        let saved = Config::load_from(&dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert!(!saved.first_run);
        assert_eq!(saved.config.loglevel, "DEBUG");
        assert!(!saved.config.goodware);
        let store = FileCredentialStore::new(dir.path().join("credentials.json"));
        assert_eq!(store.get(API_KEY).unwrap().as_deref(), Some("new-key"));
    }

    #[test]
    fn test_config_update_keeps_other_settings() {
        let dir = tempdir().unwrap();
        let existing = Config {
            auto: false,
            ..Config::default()
        };
        existing.save_to(&dir.path().join(CONFIG_FILE_NAME)).unwrap();
        let image = BinaryImage::raw(&[], 0, 64);
        let mut plugin = settings_plugin(&image, dir.path());

        save_settings(&mut plugin).unwrap();

        assert_eq!(plugin.host().prompts.get(), 1);
        let saved = Config::load_from(&dir.path().join(CONFIG_FILE_NAME)).unwrap().config;
        assert!(!saved.auto);
        assert!(!saved.goodware);
        assert_eq!(saved.loglevel, "DEBUG");
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x401000"), Ok(0x401000));
        assert_eq!(parse_address("4096"), Ok(4096));
        assert!(parse_address("0xzz").is_err());
    }
}
