mod common;

use common::Project;
use context_scan::config::BudgetUnit;
use context_scan::dead_code::{Bucket, DeadCodeFinding};
use context_scan::error::DiagnosticKind;
use context_scan::reporter::{CONTEXT_DOCUMENT, PROJECT_DOCUMENT};
use context_scan::{ProjectModel, Reporter};
use std::path::Path;

fn finding<'a>(model: &'a ProjectModel, file: &str, symbol: &str) -> &'a DeadCodeFinding {
    model
        .dead_code
        .findings
        .iter()
        .find(|f| f.file == Path::new(file) && f.symbol == symbol)
        .unwrap_or_else(|| panic!("no finding for {file}:{symbol}"))
}

#[test]
fn config_and_configs_directories_conflict() {
    let project = Project::new();
    project
        .file("config/settings.py", "DEBUG = True\nNAME = 'app'\n")
        .file("config/loader.py", "def load(value):\n    return value\n")
        .file("configs/__init__.py", "")
        .file(
            "main.py",
            "from config.settings import DEBUG, NAME\nfrom config.loader import load\n\nload(DEBUG)\nload(NAME)\n",
        );

    let model = project.scan();
    assert_eq!(model.conflicts.len(), 1);

    let conflict = &model.conflicts[0];
    assert_eq!(conflict.member_names(), vec!["config", "configs"]);
    assert_eq!(conflict.suggested_primary.as_deref(), Some("config"));
    assert!(!conflict.ambiguous);
    assert!(conflict.members[0].inbound > 0);
    assert!(!conflict.members[1].non_empty);
}

#[test]
fn unreferenced_function_is_high_confidence() {
    let project = Project::new();
    project.file("util.py", "def helper():\n    return 1\n");

    let model = project.scan();
    let helper = finding(&model, "util.py", "helper");
    assert!(helper.confidence >= 80);
    assert_eq!(helper.bucket, Bucket::High);
    assert!(helper.evidence.iter().any(|e| e == "unused"));
}

#[test]
fn private_function_used_once_in_its_file_is_medium() {
    let project = Project::new();
    project.file(
        "auth.py",
        "def _validate(token):\n    return bool(token)\n\ndef login(token):\n    return _validate(token)\n",
    );

    let model = project.scan();
    let validate = finding(&model, "auth.py", "_validate");
    assert!((60..80).contains(&validate.confidence));
    assert_eq!(validate.bucket, Bucket::Medium);
    assert!(validate.evidence.iter().any(|e| e == "self-file-only"));
}

#[test]
fn optional_import_fallback_is_low_and_dynamic() {
    let project = Project::new();
    project.file(
        "plugins.py",
        "try:\n    import optional_lib\nexcept ImportError:\n    optional_lib = None\n",
    );

    let model = project.scan();
    let optional = finding(&model, "plugins.py", "optional_lib");
    assert!(optional.confidence < 60);
    assert_eq!(optional.bucket, Bucket::Low);
    assert!(optional.evidence.iter().any(|e| e == "dynamic-uncertain"));
}

#[test]
fn empty_project_yields_an_empty_model() {
    let project = Project::new();
    let model = project.scan();

    assert!(model.files.is_empty());
    assert!(model.conflicts.is_empty());
    assert!(model.dead_code.findings.is_empty());
    assert!(!model.incomplete);

    let config = project.config();
    let document = Reporter::new(&model, &config.output).project_document();
    assert!(!document.is_truncated());
    assert!(document.diagnostics.is_empty());
    assert!(document.text.contains("@modules: 0\n"));
}

#[test]
fn repeated_scans_render_identical_documents() {
    let project = Project::new();
    project
        .file("pkg/__init__.py", "from .core import Engine\n")
        .file("pkg/core.py", "class Engine:\n    def start(self):\n        return helper()\n\ndef helper():\n    return 1\n")
        .file("app.py", "from pkg import Engine\n\nEngine().start()\n")
        .file("tests/test_app.py", "from app import Engine\n\ndef test_start():\n    assert Engine().start() == 1\n");

    let config = project.config();
    let first = project.scan();
    let second = project.scan();

    let a = Reporter::new(&first, &config.output);
    let b = Reporter::new(&second, &config.output);
    assert_eq!(a.project_document().text, b.project_document().text);
    assert_eq!(a.directory_documents(), b.directory_documents());
    assert_eq!(first.dead_code.findings, second.dead_code.findings);
    assert_eq!(first.diagnostics, second.diagnostics);
}

#[test]
fn mutual_imports_produce_one_cycle_diagnostic() {
    let project = Project::new();
    project
        .file("a.py", "import b\n\ndef f():\n    return b.g()\n")
        .file("b.py", "import a\n\ndef g():\n    return a.f()\n");

    let model = project.scan();
    assert_eq!(model.graph.cycles.len(), 1);
    let cycles = model
        .diagnostics
        .iter()
        .filter(|d| d.kind == DiagnosticKind::ImportCycle)
        .count();
    assert_eq!(cycles, 1);
}

#[test]
fn small_budget_truncates_deterministically() {
    let project = Project::new();
    for i in 0..12 {
        project.file(&format!("module_with_a_rather_long_name_{i:02}.py"), "value = 1\n");
    }

    let mut config = project.config();
    config.output.budget = 600;
    config.output.budget_unit = BudgetUnit::Chars;

    let model = project.scan_with(config.clone());
    let first = Reporter::new(&model, &config.output).project_document();
    let second = Reporter::new(&model, &config.output).project_document();

    assert!(first.is_truncated());
    assert!(first.diagnostics.is_empty());
    assert!(first.text.chars().count() <= 600);
    assert!(first.text.contains(&format!("@truncated: {} modules omitted", first.dropped.len())));
    assert_eq!(first.text, second.text);
    assert_eq!(first.dropped, second.dropped);
    assert_eq!(first.dropped[0], Path::new("module_with_a_rather_long_name_11.py"));
}

#[test]
fn update_writes_project_and_directory_documents() {
    let project = Project::new();
    project
        .file("app.py", "from lib.tools import run\n\nrun()\n")
        .file("lib/tools.py", "def run():\n    return 0\n");

    let config = project.config();
    let model = project.scan();
    let reporter = Reporter::new(&model, &config.output);
    let document = reporter.project_document();
    let written = reporter.write_documents(project.root(), &document).unwrap();

    assert!(written.contains(&project.root().join(PROJECT_DOCUMENT)));
    assert!(written.contains(&project.root().join(CONTEXT_DOCUMENT)));
    assert!(written.contains(&project.root().join("lib").join(CONTEXT_DOCUMENT)));

    let context = std::fs::read_to_string(project.root().join("lib").join(CONTEXT_DOCUMENT)).unwrap();
    assert!(context.contains("@module: lib.tools\n"));
    assert!(context.contains("- run()"));

    // generated documents are not source files
    let rescan = project.scan();
    assert_eq!(rescan.files.len(), 2);
}

#[test]
fn json_export_carries_the_whole_model() {
    let project = Project::new();
    project
        .file("app.py", "import lib\n\nlib.run()\n")
        .file("lib.py", "def run():\n    return 0\n\ndef unused():\n    return 1\n");

    let config = project.config();
    let model = project.scan();
    assert_eq!(model.file(Path::new("lib.py")).map(|f| f.module_name.as_str()), Some("lib"));

    let json = Reporter::new(&model, &config.output).export_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["modules"].as_array().map(Vec::len), Some(2));
    assert_eq!(value["dependency_analysis"]["total_edges"], 1);

    let findings = value["dead_code"]["findings"].as_array().unwrap();
    assert!(findings.iter().any(|f| f["symbol"] == "unused" && f["bucket"] == "high"));
    let run = findings.iter().find(|f| f["symbol"] == "run").unwrap();
    assert_ne!(run["bucket"], "high");
    assert!(run["evidence"].as_array().unwrap().iter().any(|e| e == "cross-file-references"));
}

#[test]
fn used_imports_and_locals_are_not_dead() {
    let project = Project::new();
    project
        .file("hub.py", "def core():\n    return 1\n")
        .file("leaf.py", "import hub\n\nhub.core()\n")
        .file("calc.py", "def f():\n    result = compute()\n    return result\n\ndef compute():\n    return 2\n\nf()\n")
        .file("discard.py", "from calc import f\n\n_ = f()\n");

    let model = project.scan();
    let symbols: Vec<&str> = model.dead_code.findings.iter().map(|f| f.symbol.as_str()).collect();
    assert!(!symbols.contains(&"hub"), "{symbols:?}");
    assert!(!symbols.contains(&"f.result"), "{symbols:?}");
    assert!(!symbols.contains(&"_"), "{symbols:?}");
    assert!(!model
        .dead_code
        .findings
        .iter()
        .any(|f| f.file == Path::new("discard.py") && f.symbol == "f"));
}

#[test]
fn module_document_respects_module_budget() {
    let project = Project::new();
    let mut main = String::new();
    for i in 0..30 {
        project.file(&format!("mods/module_number_{i:02}.py"), "def work():\n    return 1\n");
        main.push_str(&format!("import mods.module_number_{i:02}\n"));
    }
    project.file("main.py", &main);

    let mut config = project.config();
    config.output.module_budget = 200;
    config.output.budget_unit = BudgetUnit::Chars;

    let model = project.scan_with(config.clone());
    let reporter = Reporter::new(&model, &config.output);
    let main = model.file(Path::new("main.py")).unwrap();
    assert_eq!(model.graph.dependencies(Path::new("main.py")).len(), 30);

    let document = reporter.module_document(main);
    assert!(document.chars().count() <= 200, "{} chars:\n{document}", document.chars().count());
    assert!(document.contains(" more]\n"));
    assert!(document.starts_with("@module: main\n@path: main.py\n@deps: [mods.module_number_00"));
}

#[test]
fn update_keeps_hand_written_context_sections() {
    let project = Project::new();
    project
        .file("app.py", "from lib.tools import run\n\nrun()\n")
        .file("lib/tools.py", "def run():\n    return 0\n")
        .file(
            "lib/CONTEXT.llm",
            "@purpose: Helpers shared by the app.\n\n@module: lib.stale\n@path: lib/stale.py\n@deps: []\n@exports:\n- gone()\n@dead_code:\n\n@behavior:\n- run never raises\n",
        );

    let config = project.config();
    let context_path = project.root().join("lib").join(CONTEXT_DOCUMENT);

    let write = || {
        let model = project.scan();
        let reporter = Reporter::new(&model, &config.output);
        reporter.write_documents(project.root(), &reporter.project_document()).unwrap();
        std::fs::read_to_string(&context_path).unwrap()
    };

    let first = write();
    assert!(first.starts_with("@purpose: Helpers shared by the app.\n\n@behavior:\n- run never raises\n\n@module: lib.tools\n"));
    assert!(!first.contains("lib.stale"));
    assert!(!first.contains("gone()"));

    let second = write();
    assert_eq!(first, second);
}

#[test]
fn truncation_drops_least_imported_modules_first() {
    let project = Project::new();
    project.file("hub.py", "def core():\n    return 1\n");
    for i in 0..7 {
        project.file(&format!("leaf_{i:02}.py"), "import hub\n\nhub.core()\n");
    }

    let model = project.scan();
    let full = Reporter::new(&model, &project.config().output).project_document();
    assert!(!full.is_truncated());

    let mut config = project.config();
    config.output.budget = full.text.chars().count() - 1;
    config.output.budget_unit = BudgetUnit::Chars;

    let document = Reporter::new(&model, &config.output).project_document();
    assert_eq!(document.dropped, vec![Path::new("leaf_06.py").to_path_buf()]);
    assert!(document.text.chars().count() <= config.output.budget);
    assert!(document.text.contains("- hub.py\n"));
    assert!(document.text.contains("@truncated: 1 modules omitted\n"));
}

#[test]
fn budget_below_fixed_sections_drops_everything() {
    let project = Project::new();
    project.file("a.py", "x = 1\n").file("b.py", "y = 2\n");

    let mut config = project.config();
    config.output.budget = 10;
    config.output.budget_unit = BudgetUnit::Chars;

    let model = project.scan_with(config.clone());
    let document = Reporter::new(&model, &config.output).project_document();

    assert_eq!(
        document.dropped,
        vec![Path::new("b.py").to_path_buf(), Path::new("a.py").to_path_buf()]
    );
    let exceeded: Vec<_> = document
        .diagnostics
        .iter()
        .filter(|d| d.kind == DiagnosticKind::BudgetExceeded)
        .collect();
    assert_eq!(exceeded.len(), 1);
    assert_eq!(document.diagnostics.len(), 1);
    assert!(document.text.contains("@truncated: 2 modules omitted\n"));
}
