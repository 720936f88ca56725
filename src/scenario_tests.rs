#[cfg(test)]
mod tests {
    use std::fs;
    use std::rc::Rc;

    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    use crate::{
        classify::GOODWARE,
        compiler::{self, testing::FakeSource},
        config::{Config, CONFIG_FILE_NAME},
        credentials::MemoryCredentialStore,
        decoder::X86Source,
        format::{Drilldown, FAMILY_COLUMN, SHA256_COLUMN},
        logging::Logger,
        parser::{GoblinParser, ParseError},
        plugin::{testing::FakeHost, Command, SearchPlugin, RESULTS_TITLE},
        search::{testing::CannedTransport, NO_RESULTS},
        AddressRange, Operand, OperandKind,
    };

    const EMOTET_HIT: &str = r#"{
        "result_count": 1,
        "first_seen": 1609459200,
        "last_seen": 1700000000,
        "results": [{
            "sha256": "e1e1",
            "last_seen": 1700000000,
            "analysis": [{"id": "a1"}],
            "malwareid": [
                {"type": "", "name": "", "malware_family": "", "classification_type": ""},
                {"type": "", "name": "win.emotet", "malware_family": "Emotet", "classification_type": ""}
            ]
        }]
    }"#;

    struct Scenario {
        plugin: SearchPlugin<FakeHost>,
        transport: Rc<CannedTransport>,
        _dir: TempDir,
    }

    /// A started plugin over a one-instruction program with a saved config.
    fn scenario(config: Config, transport: CannedTransport) -> Scenario {
        let source = FakeSource::new()
            .code(
                0x401000,
                &[0xa1, 0x00, 0x30, 0x40, 0x00],
                &[Operand::new(OperandKind::Memory, 1)],
                "mov eax, ds:dword_403000",
            )
            .code(0x401005, &[0xc3], &[], "retn");
        let host = FakeHost::new(source, 0x401000, 0x401005);

        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        config.save_to(&path).unwrap();

        let transport = Rc::new(transport);
        let mut plugin = SearchPlugin::new(
            host,
            Logger::with_sink("UnpacMeSearch", |_, _| {}),
            path,
            Box::new(MemoryCredentialStore::with_api_key("secret")),
            transport.clone(),
        );
        plugin.start().unwrap();

        Scenario {
            plugin,
            transport,
            _dir: dir,
        }
    }

    fn no_preview() -> Config {
        Config {
            preview: false,
            goodware: false,
            ..Config::default()
        }
    }

    #[test]
    fn test_search_without_preview() {
        let mut s = scenario(no_preview(), CannedTransport::new().respond(200, EMOTET_HIT));

        s.plugin.invoke(Command::Search).unwrap();

        let requests = s.transport.requests.borrow();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].body, json!({"value": "a1 ?? ?? ?? ??"}));
        assert_eq!(requests[0].auth, "Key secret");

        let host = s.plugin.host();
        assert!(host.previews.borrow().is_empty());
        assert!(host.has_event(&format!("results:{}", RESULTS_TITLE)));
        assert!(!host.wait_box_visible());
        assert!(host.warnings().is_empty());
    }

    #[test]
    fn test_family_only_match_is_malicious() {
        let mut s = scenario(no_preview(), CannedTransport::new().respond(200, EMOTET_HIT));
        s.plugin.invoke(Command::Search).unwrap();

        let view = s.plugin.results().unwrap();
        assert_eq!(view.rows.len(), 1);
        assert_eq!(view.rows[0].cell(0).as_deref(), Some("MALICIOUS"));
        assert_eq!(view.rows[0].cell(FAMILY_COLUMN).as_deref(), Some("Emotet"));
        assert_eq!(view.summary.counts.malicious, 1);

        assert_eq!(
            s.plugin.activate(0, SHA256_COLUMN),
            Some(Drilldown::OpenUrl("https://www.unpac.me/results/a1?hash=e1e1".into()))
        );
    }

    #[test]
    fn test_absent_goodware_count_is_zero() {
        let config = Config {
            preview: false,
            goodware: true,
            ..Config::default()
        };
        let mut s = scenario(
            config,
            CannedTransport::new()
                .respond(200, EMOTET_HIT)
                .respond(200, r#"{"goodware_results": []}"#),
        );
        s.plugin.invoke(Command::Search).unwrap();

        let result = crate::classify::classify(
            serde_json::from_str(EMOTET_HIT).unwrap(),
        );
        assert_eq!(result.classification_map.get(GOODWARE), Some(&0));

        let view = s.plugin.results().unwrap();
        assert_eq!(view.summary.counts.goodware, 0);
        assert_eq!(s.transport.requests.borrow().len(), 2);
        assert_eq!(
            s.transport.requests.borrow()[1].body["repo_type"],
            json!("goodware")
        );
    }

    #[test]
    fn test_not_found_with_server_warning() {
        let mut s = scenario(
            no_preview(),
            CannedTransport::new().respond(404, r#"{"warning": "too short"}"#),
        );

        s.plugin.invoke(Command::Search).unwrap();

        let host = s.plugin.host();
        assert_eq!(host.warnings(), vec!["too short", NO_RESULTS]);
        assert!(host.shown.borrow().is_empty());
        assert!(s.plugin.results().is_none());
        assert!(!host.wait_box_visible());
    }

    #[test]
    fn test_preview_shows_fragments_and_transcript() {
        let mut s = scenario(
            Config {
                goodware: false,
                ..Config::default()
            },
            CannedTransport::new().respond(200, EMOTET_HIT),
        );
        s.plugin.host().selection.set((0x401000, 0x401006));

        s.plugin.invoke(Command::Search).unwrap();

        let previews = s.plugin.host().previews.borrow();
        assert_eq!(previews.len(), 1);
        assert_eq!(previews[0].0, "a1 ?? ?? ?? ??\nc3");
        assert_eq!(
            previews[0].1,
            "a1 00 30 40 00\tmov eax, ds:dword_403000\nc3\tretn\n"
        );
        assert_eq!(
            s.transport.requests.borrow()[0].body,
            json!({"value": "a1 ?? ?? ?? ?? c3"})
        );
    }

    #[test]
    fn test_edited_preview_is_normalized() {
        let mut s = scenario(
            Config {
                goodware: false,
                ..Config::default()
            },
            CannedTransport::new().respond(200, EMOTET_HIT),
        );
        *s.plugin.host().preview_reply.borrow_mut() = Some(Some("a1 ?? ??\n?? ??\n\n  c3\n".into()));

        s.plugin.invoke(Command::Search).unwrap();

        assert_eq!(
            s.transport.requests.borrow()[0].body,
            json!({"value": "a1 ?? ?? ?? ?? c3"})
        );
        assert_eq!(s.plugin.results().unwrap().copy_pattern(), "a1 ?? ?? ?? ?? c3");
    }

    #[test]
    fn test_cancelled_preview_sends_nothing() {
        let mut s = scenario(Config::default(), CannedTransport::new());
        *s.plugin.host().preview_reply.borrow_mut() = Some(None);

        s.plugin.invoke(Command::Search).unwrap();

        assert!(s.transport.requests.borrow().is_empty());
        assert!(s.plugin.results().is_none());
    }

    #[test]
    fn test_new_search_replaces_result_view() {
        let mut s = scenario(
            no_preview(),
            CannedTransport::new()
                .respond(200, EMOTET_HIT)
                .respond(200, EMOTET_HIT),
        );

        s.plugin.invoke(Command::Search).unwrap();
        assert!(!s.plugin.host().has_event("close_results"));

        s.plugin.invoke(Command::Search).unwrap();
        let events = s.plugin.host().events.borrow();
        let close = events.iter().position(|e| e == "close_results").unwrap();
        let last_show = events.iter().rposition(|e| e.starts_with("results:")).unwrap();
        assert!(close < last_show);
        assert_eq!(s.plugin.host().shown.borrow().len(), 2);
    }

    #[test]
    fn test_success_warning_follows_results() {
        let body = r#"{"result_count": 0, "results": [], "warning": "pattern matched many files"}"#;
        let mut s = scenario(no_preview(), CannedTransport::new().respond(200, body));

        s.plugin.invoke(Command::Search).unwrap();

        let events = s.plugin.host().events.borrow();
        let shown = events.iter().position(|e| e.starts_with("results:")).unwrap();
        let warned = events
            .iter()
            .position(|e| e == "warning:pattern matched many files")
            .unwrap();
        assert!(shown < warned);
    }

    #[test]
    fn test_transport_failure_is_reported_once() {
        let mut s = scenario(no_preview(), CannedTransport::new().fail("timed out"));

        s.plugin.invoke(Command::Search).unwrap();

        let host = s.plugin.host();
        assert_eq!(
            host.warnings(),
            vec!["Unexpected error UnpacMe...please try again. timed out"]
        );
        assert!(!host.wait_box_visible());
        assert!(s.plugin.results().is_none());
    }

    #[test]
    fn test_copy_pattern_after_search() {
        let mut s = scenario(no_preview(), CannedTransport::new().respond(200, EMOTET_HIT));
        s.plugin.invoke(Command::Search).unwrap();
        s.plugin.invoke(Command::CopyPattern).unwrap();

        assert_eq!(
            s.plugin.host().clipboard.borrow().as_deref(),
            Some("a1 ?? ?? ?? ??")
        );
    }

    #[test]
    fn test_backwards_selection() {
        let mut s = scenario(no_preview(), CannedTransport::new());
        s.plugin.host().selection.set((0x401005, 0x401000));

        s.plugin.invoke(Command::Search).unwrap();

        let warnings = s.plugin.host().warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("Start is greater than end"));
        assert!(s.transport.requests.borrow().is_empty());
    }

    // Compile real code from the host system when it is an x86 binary
    #[test]
    fn test_compile_system_binary() {
        let data = match fs::read("/bin/ls") {
            Ok(data) => data,
            Err(_) => return,
        };
        let image = match GoblinParser::new().parse(&data) {
            Ok(image) => image,
            Err(ParseError::UnsupportedArchitecture(_)) | Err(ParseError::UnsupportedFormat(_)) => return,
            Err(e) => panic!("Parser failed: {}", e),
        };

        let text = match image.segments.iter().find(|s| s.executable && s.bytes.len() >= 64) {
            Some(text) => text,
            None => return,
        };
        let source = X86Source::new(&image);
        let log = Logger::with_sink("UnpacMeSearch", |_, _| {});

        let range = AddressRange::new(text.address, text.address + 64).unwrap();
        let compiled = compiler::compile(range, &source, true, &log).unwrap();

        assert!(compiled.unit_count() > 0);
        assert!(compiled.unit_count() <= compiler::MAX_STEPS);
        assert!(!compiled.pattern().is_empty());
        assert!(compiled.byte_len() > 0);
        assert!(!compiled.transcript().is_empty());
    }
}
