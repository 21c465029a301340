//! Per-language stage command templates.
//!
//! One command list per {language, stage} pair. Languages without a
//! template resolve to [`generic_commands`], an inert echo pipeline.

use shipline_core::{Language, Platform, StageKind, SuiteKind, TestSuite};

fn cmds(lines: &[&str]) -> Vec<String> {
    lines.iter().map(|l| l.to_string()).collect()
}

/// Commands for `kind` in a `language` project targeting `platforms`.
///
/// Deploy, post-deploy and monitor stages are language independent.
pub fn commands_for(
    language: &Language,
    kind: StageKind,
    platforms: &[Platform],
    health_base_url: Option<&str>,
) -> Vec<String> {
    match kind {
        StageKind::Deploy => return deploy_commands(),
        StageKind::PostDeployTest => return post_deploy_commands(health_base_url),
        StageKind::MonitorSetup => {
            return cmds(&[
                "echo \"monitoring $SHIPLINE_ENVIRONMENT at $SHIPLINE_COMMIT\"",
            ])
        }
        StageKind::Custom => return Vec::new(),
        _ => {}
    }

    match language {
        Language::Flutter => flutter_commands(kind, platforms),
        Language::Rust => rust_commands(kind),
        Language::Node => node_commands(kind),
        Language::Python => python_commands(kind),
        Language::Go => go_commands(kind),
        Language::Java => java_commands(kind),
        Language::Other(tag) => generic_commands(tag, kind),
    }
}

/// Inert fallback for ecosystems without a template.
pub fn generic_commands(tag: &str, kind: StageKind) -> Vec<String> {
    vec![format!(
        "echo \"{}: no {} template, nothing to do\"",
        kind.name(),
        tag
    )]
}

fn flutter_commands(kind: StageKind, platforms: &[Platform]) -> Vec<String> {
    match kind {
        StageKind::Setup => cmds(&["flutter --version", "flutter pub get"]),
        StageKind::CodeQuality => cmds(&[
            "dart format --output=none --set-exit-if-changed .",
            "flutter analyze",
        ]),
        StageKind::Build => {
            let mut out: Vec<String> = platforms.iter().filter_map(flutter_build).collect();
            if out.is_empty() {
                out.push("flutter build web --release".into());
            }
            out
        }
        StageKind::Test => cmds(&["flutter test --coverage"]),
        StageKind::SecurityScan => cmds(&["dart pub outdated --no-dev-dependencies"]),
        StageKind::Package => {
            let mut out: Vec<String> = platforms.iter().filter_map(flutter_package).collect();
            if out.is_empty() {
                out.push("tar -czf build/web.tar.gz -C build web".into());
            }
            out
        }
        _ => Vec::new(),
    }
}

fn flutter_build(platform: &Platform) -> Option<String> {
    let cmd = match platform {
        Platform::Android => "flutter build apk --release",
        Platform::Ios => "flutter build ios --release --no-codesign",
        Platform::Web => "flutter build web --release",
        Platform::Linux => "flutter build linux --release",
        Platform::Macos => "flutter build macos --release",
        Platform::Windows => "flutter build windows --release",
        Platform::Server | Platform::Other(_) => return None,
    };
    Some(cmd.to_string())
}

fn flutter_package(platform: &Platform) -> Option<String> {
    let cmd = match platform {
        Platform::Android => "flutter build appbundle --release",
        Platform::Ios => "flutter build ipa --release --no-codesign",
        Platform::Web => "tar -czf build/web.tar.gz -C build web",
        Platform::Linux => "tar -czf build/linux.tar.gz -C build linux",
        Platform::Macos => "tar -czf build/macos.tar.gz -C build macos",
        Platform::Windows => "tar -czf build/windows.tar.gz -C build windows",
        Platform::Server | Platform::Other(_) => return None,
    };
    Some(cmd.to_string())
}

fn rust_commands(kind: StageKind) -> Vec<String> {
    match kind {
        StageKind::Setup => cmds(&["cargo --version", "cargo fetch"]),
        StageKind::CodeQuality => cmds(&[
            "cargo fmt --all -- --check",
            "cargo clippy --workspace --all-targets -- -D warnings",
        ]),
        StageKind::Build => cmds(&["cargo build --workspace --release"]),
        StageKind::Test => cmds(&["cargo test --workspace"]),
        StageKind::SecurityScan => cmds(&["cargo audit"]),
        StageKind::Package => cmds(&["tar -czf target/release.tar.gz -C target release"]),
        _ => Vec::new(),
    }
}

fn node_commands(kind: StageKind) -> Vec<String> {
    match kind {
        StageKind::Setup => cmds(&["node --version", "npm ci"]),
        StageKind::CodeQuality => cmds(&["npx eslint .", "npx prettier --check ."]),
        StageKind::Build => cmds(&["npm run build"]),
        StageKind::Test => cmds(&["npm test"]),
        StageKind::SecurityScan => cmds(&["npm audit --audit-level=high"]),
        StageKind::Package => cmds(&["npm pack"]),
        _ => Vec::new(),
    }
}

fn python_commands(kind: StageKind) -> Vec<String> {
    match kind {
        StageKind::Setup => cmds(&["python --version", "pip install -r requirements.txt"]),
        StageKind::CodeQuality => cmds(&["ruff check .", "black --check ."]),
        StageKind::Build => cmds(&["python -m compileall -q ."]),
        StageKind::Test => cmds(&["pytest"]),
        StageKind::SecurityScan => cmds(&["pip-audit"]),
        StageKind::Package => cmds(&["python -m build"]),
        _ => Vec::new(),
    }
}

fn go_commands(kind: StageKind) -> Vec<String> {
    match kind {
        StageKind::Setup => cmds(&["go version", "go mod download"]),
        StageKind::CodeQuality => cmds(&["test -z \"$(gofmt -l .)\"", "go vet ./..."]),
        StageKind::Build => cmds(&["go build ./..."]),
        StageKind::Test => cmds(&["go test ./..."]),
        StageKind::SecurityScan => cmds(&["govulncheck ./..."]),
        StageKind::Package => cmds(&["go build -o dist/ ./..."]),
        _ => Vec::new(),
    }
}

fn java_commands(kind: StageKind) -> Vec<String> {
    match kind {
        StageKind::Setup => cmds(&["mvn -B -v", "mvn -B dependency:resolve"]),
        StageKind::CodeQuality => cmds(&["mvn -B checkstyle:check"]),
        StageKind::Build => cmds(&["mvn -B -DskipTests compile"]),
        StageKind::Test => cmds(&["mvn -B test"]),
        StageKind::SecurityScan => cmds(&["mvn -B org.owasp:dependency-check-maven:check"]),
        StageKind::Package => cmds(&["mvn -B -DskipTests package"]),
        _ => Vec::new(),
    }
}

fn deploy_commands() -> Vec<String> {
    cmds(&[
        "if [ -x ./deploy.sh ]; then ./deploy.sh \"$SHIPLINE_ENVIRONMENT\" \"$SHIPLINE_COMMIT\"; \
         else echo \"no deploy.sh; recorded $SHIPLINE_COMMIT for $SHIPLINE_ENVIRONMENT\"; fi",
    ])
}

fn post_deploy_commands(health_base_url: Option<&str>) -> Vec<String> {
    match health_base_url {
        Some(base) => vec![format!(
            "curl -fsS \"{}/health\"",
            base.trim_end_matches('/')
                .replace("{env}", "$SHIPLINE_ENVIRONMENT")
        )],
        None => cmds(&["echo \"post-deploy checks: no health endpoint configured\""]),
    }
}

/// Default suites for a language. E2E suites start disabled and optional.
pub fn default_suites(language: &Language, timeout_secs: u64) -> Vec<TestSuite> {
    let (unit, integration, e2e): (&[&str], &[&str], &[&str]) = match language {
        Language::Flutter => (
            &["flutter test test/unit"],
            &["flutter test test/widget"],
            &["flutter test integration_test"],
        ),
        Language::Rust => (
            &["cargo test --workspace --lib"],
            &["cargo test --workspace --tests"],
            &["cargo test --workspace -- --ignored"],
        ),
        Language::Node => (
            &["npm test -- --testPathPattern=unit"],
            &["npm test -- --testPathPattern=integration"],
            &["npx playwright test"],
        ),
        Language::Python => (
            &["pytest tests/unit"],
            &["pytest tests/integration"],
            &["pytest tests/e2e"],
        ),
        Language::Go => (
            &["go test -short ./..."],
            &["go test -run Integration ./..."],
            &["go test -tags e2e ./..."],
        ),
        Language::Java => (
            &["mvn -B test"],
            &["mvn -B verify -DskipUnitTests"],
            &["mvn -B verify -Pe2e"],
        ),
        Language::Other(tag) => {
            return vec![TestSuite::new(
                SuiteKind::Unit,
                vec![format!("echo \"unit: no {tag} template, nothing to do\"")],
                timeout_secs,
            )]
        }
    };

    vec![
        TestSuite::new(SuiteKind::Unit, cmds(unit), timeout_secs),
        TestSuite::new(SuiteKind::Integration, cmds(integration), timeout_secs),
        TestSuite::new(SuiteKind::E2e, cmds(e2e), timeout_secs)
            .optional()
            .disabled(),
    ]
}
