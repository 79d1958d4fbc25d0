use assert_cmd::cargo::cargo_bin_cmd;

fn help_output(args: &[&str]) -> String {
    let assert = cargo_bin_cmd!("nixrm").args(args).assert().success();
    String::from_utf8(assert.get_output().stdout.clone()).expect("utf8 help")
}

#[test]
fn top_level_help_lists_run() {
    let output = help_output(&["--help"]);
    assert!(output.contains("run"), "run missing from help: {output}");
    assert!(output.contains("--json"), "global options missing: {output}");
}

#[test]
fn run_help_shows_usage_and_examples() {
    let output = help_output(&["run", "--help"]);
    assert!(
        output.contains("nixrm run <INSTALLABLE> <HOST> [-c <COMMAND> [ARGS...]]"),
        "run usage missing: {output}"
    );
    assert!(
        output.contains("nixrm run nixpkgs#hello build-box"),
        "run example missing: {output}"
    );
    assert!(output.contains("--library-path"), "{output}");
}
