//! End-to-end sandbox tests.
//!
//! The `sh` tests run anywhere. Tests marked `#[ignore]` need python3, node
//! or a Docker daemon on the host:
//!   cargo test -p autograder-worker -- --ignored

#[cfg(test)]
mod process_tests {
    use crate::config::LanguageExecution;
    use crate::engine::{ProcessSandbox, Sandbox};
    use autograder_common::types::ExecutionRequest;

    fn sh_sandbox() -> ProcessSandbox {
        ProcessSandbox::new(LanguageExecution {
            command: "sh".to_string(),
            args: vec!["{file}".to_string()],
            file_name: "script.sh".to_string(),
        })
    }

    fn request(source: &str, stdin: &str, timeout_seconds: u64) -> ExecutionRequest {
        ExecutionRequest {
            source: source.to_string(),
            stdin: stdin.to_string(),
            timeout_seconds,
            file_name: String::new(),
        }
    }

    #[tokio::test]
    async fn test_reads_stdin_and_captures_output() {
        let result = sh_sandbox()
            .execute(&request("read a\nread b\necho $((a + b))\n", "3\n4", 5))
            .await
            .unwrap();

        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.output, "7\n");
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_ordinary_and_stderr_is_merged() {
        let result = sh_sandbox()
            .execute(&request("echo before\necho oops >&2\nexit 3\n", "", 5))
            .await
            .unwrap();

        assert_eq!(result.exit_code, Some(3));
        assert!(result.output.contains("before"));
        assert!(result.output.contains("oops"));
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let started = std::time::Instant::now();
        let result = sh_sandbox()
            .execute(&request("echo started\nsleep 5\necho never\n", "", 1))
            .await
            .unwrap();

        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
        assert!(result.output.contains("started"));
        assert!(!result.output.contains("never"));
        assert!(started.elapsed() < std::time::Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_declared_file_name_is_used() {
        let mut req = request("basename \"$0\"\n", "", 5);
        req.file_name = "soma.sh".to_string();

        let result = sh_sandbox().execute(&req).await.unwrap();
        assert_eq!(result.output.trim(), "soma.sh");
    }

    #[tokio::test]
    async fn test_worker_environment_is_hidden() {
        std::env::set_var("AUTOGRADER_PASSWORD", "s3cret");

        let result = sh_sandbox()
            .execute(&request("echo \"pw=$AUTOGRADER_PASSWORD\"\necho \"home=$HOME\"\n", "", 5))
            .await
            .unwrap();

        assert_eq!(result.exit_code, Some(0));
        assert!(result.output.contains("pw=\n"));
        assert!(!result.output.contains("s3cret"));
        assert!(!result.output.contains("home=\n"));
    }

    #[tokio::test]
    async fn test_timeout_kills_background_jobs() {
        let outside = tempfile::tempdir().unwrap();
        let marker = outside.path().join("marker");
        let source = format!("(sleep 2; echo alive > '{}') &\nsleep 10\n", marker.display());

        let result = sh_sandbox().execute(&request(&source, "", 1)).await.unwrap();
        assert!(result.timed_out);

        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        assert!(!marker.exists(), "background job outlived the run");
    }

    #[tokio::test]
    async fn test_each_run_gets_a_fresh_directory() {
        let sandbox = sh_sandbox();
        sandbox.execute(&request("touch leftover\n", "", 5)).await.unwrap();

        let result = sandbox
            .execute(&request("ls leftover 2>/dev/null || echo clean\n", "", 5))
            .await
            .unwrap();
        assert_eq!(result.output.trim(), "clean");
    }
}

#[cfg(test)]
mod runtime_tests {
    use crate::config::LanguageConfigManager;
    use crate::docker::{teardown, ContainerSpec, DockerRuntime};
    use crate::engine::{ContainerSandbox, ProcessSandbox, Sandbox};
    use crate::runner::{LanguageRunner, ProblemRunner, TextRunner};
    use autograder_common::types::{ExecutionRequest, ProblemCase, Tally, TestCase, TestSpec};
    use std::path::Path;
    use std::sync::Arc;

    fn languages() -> LanguageConfigManager {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/languages.json");
        LanguageConfigManager::load(Path::new(path)).expect("Failed to load language config")
    }

    #[tokio::test]
    #[ignore] // Requires python3
    async fn test_python_testcases_scenario() {
        let python = languages().get_config("python").unwrap().clone();
        let sandbox = Arc::new(ProcessSandbox::new(python.execution.clone()));
        let runner = TextRunner::new(python, sandbox);

        let spec = TestSpec::Cases {
            cases: vec![TestCase::new("3\n4", "7"), TestCase::new("10\n-2", "8")],
            run_template: None,
        };
        let outcome = runner
            .evaluate(&spec, "a = int(input())\nb = int(input())\nprint(a + b)", None)
            .await
            .unwrap();

        assert!(outcome.success, "output: {}", outcome.output);
        assert_eq!(outcome.tally, Some(Tally::new(2, 2)));
    }

    #[tokio::test]
    #[ignore] // Requires python3
    async fn test_python_testcode_harness() {
        let python = languages().get_config("python").unwrap().clone();
        let sandbox = Arc::new(ProcessSandbox::new(python.execution.clone()));
        let runner = TextRunner::new(python, sandbox);

        let spec = TestSpec::Code {
            template: "[[[header]]]\n[[[code]]]\n[[[footer]]]\n\
                       print('.' if dobro(2) == 4 else 'F', end='')\n\
                       print('.' if dobro(0) == 0 else 'F')"
                .to_string(),
        };

        // Prints inside the answer are silenced by the header
        let passing = "print('debug')\ndef dobro(x):\n    return 2 * x";
        let outcome = runner.evaluate(&spec, passing, None).await.unwrap();
        assert!(outcome.success, "output: {}", outcome.output);

        let failing = "def dobro(x):\n    return x + 2";
        let outcome = runner.evaluate(&spec, failing, None).await.unwrap();
        assert!(!outcome.success);
    }

    #[tokio::test]
    #[ignore] // Requires node
    async fn test_problem_stage_model_outcome() {
        let javascript = languages().get_config("javascript").unwrap().clone();
        let sandbox = Arc::new(ProcessSandbox::new(javascript.execution.clone()));
        let runner = ProblemRunner::new(javascript, sandbox);

        let clean = TestSpec::Problem {
            stage_type: Some("cleaning".to_string()),
            stage_data: serde_json::json!({"map": ["r..", "..."]}),
            test_cases: None,
        };
        let outcome = runner.evaluate(&clean, "", None).await.unwrap();
        assert!(outcome.success, "output: {}", outcome.output);

        let dirty = TestSpec::Problem {
            stage_type: Some("cleaning".to_string()),
            stage_data: serde_json::json!({"map": ["r.d"]}),
            test_cases: None,
        };
        let outcome = runner.evaluate(&dirty, "", None).await.unwrap();
        assert!(!outcome.success);
    }

    #[tokio::test]
    #[ignore] // Requires node
    async fn test_problem_prompt_reads_case_input() {
        let javascript = languages().get_config("javascript").unwrap().clone();
        let sandbox = Arc::new(ProcessSandbox::new(javascript.execution.clone()));
        let runner = ProblemRunner::new(javascript, sandbox);

        let spec = TestSpec::Problem {
            stage_type: None,
            stage_data: serde_json::Value::Null,
            test_cases: Some(vec![ProblemCase {
                input: "21".to_string(),
                output: Some("42".to_string()),
                data: None,
            }]),
        };
        let answer = "const x = prompt();\nconsole.log(Number(x) * 2);";
        let outcome = runner.evaluate(&spec, answer, None).await.unwrap();
        assert!(outcome.success, "output: {}", outcome.output);
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_warm_container_reuse_and_timeout() {
        let python = languages().get_config("python").unwrap().clone();
        let scratch_root = tempfile::tempdir().unwrap();
        let mut container = ContainerSpec::for_language(&python, scratch_root.path());
        container.name = format!("autograder-test-{}", uuid::Uuid::new_v4());

        let runtime = Arc::new(DockerRuntime::connect().unwrap());
        let sandbox = ContainerSandbox::new(runtime.clone(), container.clone(), python.execution.clone());

        let sum = ExecutionRequest {
            source: "print(int(input()) + int(input()))".to_string(),
            stdin: "3\n4".to_string(),
            timeout_seconds: 5,
            file_name: String::new(),
        };
        let result = sandbox.execute(&sum).await.unwrap();
        assert_eq!(result.output.trim(), "7");
        assert_eq!(result.exit_code, Some(0));

        // Second run reuses the running container
        let result = sandbox.execute(&sum).await.unwrap();
        assert_eq!(result.output.trim(), "7");

        let slow = ExecutionRequest {
            source: "import time\nprint('started', flush=True)\ntime.sleep(30)".to_string(),
            stdin: String::new(),
            timeout_seconds: 1,
            file_name: String::new(),
        };
        let result = sandbox.execute(&slow).await.unwrap();
        assert!(result.timed_out);
        assert!(result.output.contains("started"));

        let result = sandbox
            .execute(&ExecutionRequest {
                source: "import urllib.request\nurllib.request.urlopen('http://example.com', timeout=2)".to_string(),
                stdin: String::new(),
                timeout_seconds: 5,
                file_name: String::new(),
            })
            .await
            .unwrap();
        assert_ne!(result.exit_code, Some(0), "network should be disabled");

        assert!(teardown(runtime.as_ref(), &container.name).await.unwrap());
    }
}
