use jobgate::config::Settings;
use jobgate::error::PathKind;
use jobgate::job::{Arg, StagedSource};
use jobgate::operation::{FUZZ_TIMEOUT_MARGIN, Operation};
use serde_json::json;
use std::time::Duration;

fn op(value: serde_json::Value) -> Operation {
    serde_json::from_value(value).expect("operation")
}

fn literals(args: &[Arg]) -> Vec<String> {
    args.iter()
        .map(|arg| match arg {
            Arg::Literal(value) => value.clone(),
            Arg::Input(idx) => format!("<input {idx}>"),
            Arg::Staged(idx) => format!("<staged {idx}>"),
        })
        .collect()
}

#[test]
fn scan_builds_gitleaks_command() {
    let spec = op(json!({"op": "scan", "target": "repo", "no_git": true}))
        .to_job(&Settings::default())
        .expect("job");

    assert_eq!(spec.kind, "scan");
    assert_eq!(
        literals(&spec.args),
        vec![
            "gitleaks",
            "detect",
            "--source",
            "<input 0>",
            "--report-format",
            "json",
            "--report-path",
            "report.json",
            "--exit-code",
            "0",
            "--no-git",
        ]
    );
    assert_eq!(spec.inputs[0].raw, "repo");
    assert_eq!(spec.inputs[0].expect, PathKind::Any);
    assert!(spec.cwd.is_none());
}

#[test]
fn reverse_defaults_to_labeling_both_modes() {
    let operation = op(json!({"op": "reverse", "filepath": "prog.so"}));
    let mut settings = Settings::default();
    settings.tools.solazy = "/opt/sol-azy".to_string();
    let spec = operation.to_job(&settings).expect("job");

    assert_eq!(
        literals(&spec.args),
        vec![
            "/opt/sol-azy",
            "reverse",
            "--mode",
            "both",
            "--out-dir",
            ".",
            "--bytecodes-file",
            "<input 0>",
            "--labeling",
        ]
    );
    assert_eq!(spec.inputs[0].expect, PathKind::File);

    let opts = operation.render_options(1000);
    assert!(!opts.include_stdout);
    assert!(!opts.include_stderr);
    assert!(!opts.include_previews);
}

#[test]
fn reverse_flags_and_previews() {
    let operation = op(json!({
        "op": "reverse",
        "filepath": "prog.so",
        "mode": "cfg",
        "labeling": false,
        "reduced": true,
        "only_entrypoint": true,
        "include_artifact_previews": true,
        "timeout": 30,
    }));
    let spec = operation.to_job(&Settings::default()).expect("job");

    let args = literals(&spec.args);
    assert!(args.contains(&"cfg".to_string()));
    assert!(!args.contains(&"--labeling".to_string()));
    assert!(args.ends_with(&["--reduced".to_string(), "--only-entrypoint".to_string()]));
    assert_eq!(spec.timeout, Some(Duration::from_secs(30)));
    assert!(operation.render_options(1000).include_previews);
}

#[test]
fn sast_with_rules_dir() {
    let spec = op(json!({
        "op": "sast",
        "target_dir": "project",
        "rules_dir": "rules",
        "use_internal_rules": false,
    }))
    .to_job(&Settings::default())
    .expect("job");

    assert_eq!(
        literals(&spec.args),
        vec![
            "sol-azy",
            "sast",
            "-d",
            "<input 0>",
            "-r",
            "<input 1>",
            "--no-internal-rules",
        ]
    );
    assert!(spec.inputs.iter().all(|input| input.expect == PathKind::Dir));
}

#[test]
fn fetch_sends_domain_on_stdin() {
    let spec = op(json!({"op": "fetch", "domain": " example.com ", "dates": true}))
        .to_job(&Settings::default())
        .expect("job");

    assert_eq!(literals(&spec.args), vec!["waybackurls", "-dates"]);
    assert_eq!(spec.stdin.as_deref(), Some(b"example.com\n".as_slice()));
    assert!(spec.inputs.is_empty());
}

#[test]
fn fetch_rejects_bad_domains() {
    for domain in ["", "   ", "a b.com", "evil.com\nrm", "https://", "-o.com"] {
        let err = op(json!({"op": "fetch", "domain": domain}))
            .to_job(&Settings::default())
            .expect_err("invalid domain");
        assert_eq!(err.code(), "invalid_request", "{domain:?}");
    }
}

#[test]
fn fuzz_runs_in_workspace_with_margin() {
    let spec = op(json!({
        "op": "fuzz",
        "workspace": "contracts",
        "test_timeout": 120,
        "workers": 4,
        "target_contracts": ["A", "B"],
        "fail_fast": true,
    }))
    .to_job(&Settings::default())
    .expect("job");

    assert_eq!(spec.cwd, Some(0));
    assert_eq!(spec.inputs[0].raw, "contracts");
    assert_eq!(spec.inputs[0].expect, PathKind::Dir);
    assert_eq!(
        literals(&spec.args),
        vec![
            "medusa",
            "fuzz",
            "--workers",
            "4",
            "--target-contracts",
            "A,B",
            "--fail-fast",
            "--timeout",
            "120",
        ]
    );
    assert_eq!(
        spec.deadline(Duration::from_secs(300)),
        Duration::from_secs(120) + FUZZ_TIMEOUT_MARGIN
    );
}

#[test]
fn deadline_falls_back_to_default() {
    let spec = op(json!({"op": "fuzz", "workspace": "contracts"}))
        .to_job(&Settings::default())
        .expect("job");
    assert_eq!(spec.deadline(Duration::from_secs(300)), Duration::from_secs(300));
}

#[test]
fn exec_requires_opt_in() {
    let operation = op(json!({"op": "exec", "argv": ["echo", "hi"], "timeout": 5}));

    let err = operation
        .to_job(&Settings::default())
        .expect_err("disabled");
    assert_eq!(err.code(), "invalid_request");

    let settings = Settings {
        allow_exec: true,
        ..Settings::default()
    };
    let spec = operation.to_job(&settings).expect("enabled");
    assert_eq!(literals(&spec.args), vec!["echo", "hi"]);
    assert_eq!(spec.timeout, Some(Duration::from_secs(5)));
    assert!(operation.render_options(1000).include_stdout);
}

#[test]
fn exec_rejects_empty_argv() {
    let settings = Settings {
        allow_exec: true,
        ..Settings::default()
    };
    let err = op(json!({"op": "exec", "argv": []}))
        .to_job(&settings)
        .expect_err("empty argv");
    assert_eq!(err.code(), "invalid_request");
}

#[test]
fn unknown_fields_and_ops_do_not_parse() {
    assert!(
        serde_json::from_value::<Operation>(json!({"op": "scan", "target": "x", "extra": 1}))
            .is_err()
    );
    assert!(serde_json::from_value::<Operation>(json!({"op": "format_disk"})).is_err());
    assert!(serde_json::from_value::<Operation>(json!({"op": "scan"})).is_err());
}

#[test]
fn zero_timeout_means_default() {
    let spec = op(json!({"op": "scan", "target": "x", "timeout": 0}))
        .to_job(&Settings::default())
        .expect("job");
    assert!(spec.timeout.is_none());
}

#[test]
fn fetch_reduces_urls_to_lowercase_host() {
    for (raw, host) in [
        ("https://Example.com/", "example.com"),
        ("http://WWW.Example.com/path?q=1", "www.example.com"),
        ("  Sub.Example.COM  ", "sub.example.com"),
        ("example.com:8080/x", "example.com:8080"),
    ] {
        let spec = op(json!({"op": "fetch", "domain": raw}))
            .to_job(&Settings::default())
            .expect("job");
        assert_eq!(
            spec.stdin.as_deref(),
            Some(format!("{host}\n").as_bytes()),
            "{raw:?}"
        );
    }
}

#[test]
fn detect_stages_inline_content() {
    let operation = op(json!({"op": "detect", "content": "token = ghp_abc"}));
    let spec = operation.to_job(&Settings::default()).expect("job");

    assert_eq!(spec.kind, "detect");
    assert_eq!(
        literals(&spec.args),
        vec![
            "gitleaks",
            "detect",
            "--source",
            "<staged 0>",
            "--report-format",
            "json",
            "--report-path",
            "report.json",
            "--exit-code",
            "0",
            "--no-git",
        ]
    );
    assert!(spec.inputs.is_empty());
    assert_eq!(spec.staged.len(), 1);
    assert!(spec.staged[0].transient);
    assert_eq!(
        spec.staged[0].source,
        StagedSource::Inline(b"token = ghp_abc".to_vec())
    );
}

#[test]
fn detect_rejects_oversized_content() {
    let settings = Settings {
        max_file_size: 4,
        ..Settings::default()
    };
    let err = op(json!({"op": "detect", "content": "too long"}))
        .to_job(&settings)
        .expect_err("too large");
    assert_eq!(err.code(), "invalid_request");
}

#[test]
fn recap_previews_markdown_by_default() {
    let operation = op(json!({"op": "recap", "anchor_dir": "anchor"}));
    let spec = operation.to_job(&Settings::default()).expect("job");

    assert_eq!(literals(&spec.args), vec!["sol-azy", "recap", "-d", "<input 0>"]);
    assert_eq!(spec.inputs[0].expect, PathKind::Dir);
    assert_eq!(
        operation.render_options(1000).named_previews,
        vec!["recap-solazy.md"]
    );

    let quiet = op(json!({"op": "recap", "anchor_dir": "anchor", "include_markdown": false}));
    assert!(quiet.render_options(1000).named_previews.is_empty());
}

#[test]
fn fetcher_passes_program_and_rpc() {
    let spec = op(json!({
        "op": "fetcher",
        "program_id": "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA",
        "rpc_url": "https://api.mainnet-beta.solana.com",
    }))
    .to_job(&Settings::default())
    .expect("job");

    assert_eq!(
        literals(&spec.args),
        vec![
            "sol-azy",
            "fetcher",
            "-p",
            "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA",
            "-o",
            ".",
            "-r",
            "https://api.mainnet-beta.solana.com",
        ]
    );
}

#[test]
fn fetcher_rejects_flag_like_values() {
    for args in [
        json!({"op": "fetcher", "program_id": "--help"}),
        json!({"op": "fetcher", "program_id": ""}),
        json!({"op": "fetcher", "program_id": "abc", "rpc_url": "-x"}),
    ] {
        let err = op(args.clone())
            .to_job(&Settings::default())
            .expect_err("invalid");
        assert_eq!(err.code(), "invalid_request", "{args}");
    }
}

#[test]
fn dotting_copies_inputs_and_previews_updated_graph() {
    let operation = op(json!({
        "op": "dotting",
        "config_path": "uploads/functions.json",
        "reduced_dot_path": "uploads/reduced.dot",
        "full_dot_path": "uploads/full.dot",
        "include_updated_dot": true,
    }));
    let spec = operation.to_job(&Settings::default()).expect("job");

    assert_eq!(
        literals(&spec.args),
        vec![
            "sol-azy",
            "dotting",
            "-c",
            "<staged 0>",
            "-r",
            "<staged 1>",
            "-f",
            "<staged 2>",
        ]
    );
    let names: Vec<&str> = spec.staged.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["functions.json", "reduced.dot", "full.dot"]);
    assert!(spec.staged.iter().all(|f| !f.transient));
    assert!(spec.inputs.iter().all(|input| input.expect == PathKind::File));
    assert_eq!(spec.staged[1].source, StagedSource::Copy(1));
    assert_eq!(
        operation.render_options(1000).named_previews,
        vec!["updated_reduced.dot"]
    );
}

#[test]
fn dotting_with_clashing_names_is_rejected() {
    let spec = op(json!({
        "op": "dotting",
        "config_path": "a/graph.dot",
        "reduced_dot_path": "b/graph.dot",
        "full_dot_path": "c/full.dot",
    }))
    .to_job(&Settings::default())
    .expect("job");

    let err = spec.check_staged().expect_err("duplicate names");
    assert_eq!(err.code(), "invalid_request");
}
