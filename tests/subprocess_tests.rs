//! 子进程 Runner 集成测试（用 shell 脚本模拟 agent CLI）

#[cfg(unix)]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use ai_cli_chat_bridge::runner::{CodexRunner, RunSession, Runner, SubprocessOptions};
    use ai_cli_chat_bridge::{ActionKind, EngineConfig, Error, Event, ResumeToken, RunStatus};
    use tempfile::{tempdir, TempDir};
    use tokio::time::{sleep, timeout};
    use tokio_util::sync::CancellationToken;

    /// 写一个假的 codex 可执行文件
    fn fake_agent(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("codex");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn runner(program: &Path) -> CodexRunner {
        let options = SubprocessOptions {
            kill_grace: Duration::from_millis(500),
            ..SubprocessOptions::default()
        };
        CodexRunner::new(EngineConfig::new(program), options)
    }

    async fn collect(mut session: RunSession) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = timeout(Duration::from_secs(10), session.next_event()).await.unwrap() {
            events.push(event);
        }
        events
    }

    fn completed(events: &[Event]) -> &ai_cli_chat_bridge::CompletedEvent {
        match events.last() {
            Some(Event::Completed(c)) => c,
            other => panic!("Expected Completed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_successful_run() {
        let dir = tempdir().unwrap();
        let out = dir.path().display().to_string();
        let program = fake_agent(
            &dir,
            &format!(
                r#"cat > "{out}/prompt.txt"
echo "$@" > "{out}/args.txt"
echo '{{"type":"thread.started","thread_id":"t-1"}}'
echo 'not json at all'
echo '{{"type":"item.started","item":{{"id":"c1","type":"command_execution","command":"ls","status":"in_progress"}}}}'
echo '{{"type":"item.completed","item":{{"id":"c1","type":"command_execution","command":"ls","exit_code":0,"status":"completed"}}}}'
echo '{{"type":"mystery.record"}}'
echo '{{"type":"item.completed","item":{{"id":"m1","type":"agent_message","text":"hello from fake"}}}}'"#
            ),
        );
        let runner = runner(&program);
        let resume = ResumeToken::new("codex", "t-0");

        let session = runner.spawn("hi there", Some(&resume), CancellationToken::new()).await.unwrap();
        assert!(session.handle().pid().is_some());
        let events = collect(session).await;

        // 非法行被跳过，未知记录透传
        assert_eq!(events.len(), 5);
        assert!(matches!(&events[0], Event::Started { resume, .. } if resume.value == "t-1"));
        assert!(matches!(&events[3], Event::Action { action, .. } if action.kind == ActionKind::Passthrough));

        let done = completed(&events);
        assert_eq!(done.status, RunStatus::Done);
        assert_eq!(done.answer.as_deref(), Some("hello from fake"));
        assert_eq!(done.resume, Some(ResumeToken::new("codex", "t-1")));

        assert_eq!(fs::read_to_string(dir.path().join("prompt.txt")).unwrap(), "hi there");
        let args = fs::read_to_string(dir.path().join("args.txt")).unwrap();
        assert!(args.contains("exec --json"));
        assert!(args.contains("resume t-0 -"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_keeps_resume_and_stderr() {
        let dir = tempdir().unwrap();
        let program = fake_agent(
            &dir,
            r#"cat > /dev/null
echo '{"type":"thread.started","thread_id":"t-2"}'
echo 'fatal: model overloaded' >&2
exit 3"#,
        );

        let session = runner(&program).spawn("x", None, CancellationToken::new()).await.unwrap();
        let events = collect(session).await;

        let failed = completed(&events);
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.resume, Some(ResumeToken::new("codex", "t-2")));
        let error = failed.error.as_deref().unwrap();
        assert!(error.contains("codex exited with code 3"));
        assert!(error.contains("fatal: model overloaded"));
    }

    #[tokio::test]
    async fn test_exit_without_answer_is_failure() {
        let dir = tempdir().unwrap();
        let program = fake_agent(&dir, "cat > /dev/null\necho '{\"type\":\"turn.started\"}'");

        let session = runner(&program).spawn("x", None, CancellationToken::new()).await.unwrap();
        let events = collect(session).await;

        let failed = completed(&events);
        assert_eq!(failed.status, RunStatus::Failed);
        assert!(failed.error.as_deref().unwrap().contains("without an answer"));
    }

    #[cfg(target_os = "linux")]
    fn process_gone(pid: i32) -> bool {
        match fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Err(_) => true,
            // 僵尸进程也算已终止
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map(|rest| rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cancel_kills_process_group() {
        let dir = tempdir().unwrap();
        let out = dir.path().display().to_string();
        let program = fake_agent(
            &dir,
            &format!(
                r#"cat > /dev/null
sleep 30 &
echo $! > "{out}/helper.pid"
echo '{{"type":"thread.started","thread_id":"t-3"}}'
wait"#
            ),
        );

        let cancel = CancellationToken::new();
        let runner = runner(&program);
        let mut session = runner.spawn("x", None, cancel.clone()).await.unwrap();

        let first = timeout(Duration::from_secs(10), session.next_event()).await.unwrap();
        assert!(matches!(first, Some(Event::Started { .. })));

        let pid_file = dir.path().join("helper.pid");
        timeout(Duration::from_secs(5), async {
            while !pid_file.exists() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let helper: i32 = fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();

        runner.cancel(&session.handle());
        // 幂等
        runner.cancel(&session.handle());

        let events = collect(session).await;
        let cancelled = completed(&events);
        assert_eq!(cancelled.status, RunStatus::Cancelled);
        assert_eq!(cancelled.resume, Some(ResumeToken::new("codex", "t-3")));

        timeout(Duration::from_secs(5), async {
            while !process_gone(helper) {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("后台子进程应随进程组一起终止");
    }

    #[cfg(target_os = "linux")]
    async fn read_pid(path: &Path) -> i32 {
        timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(text) = fs::read_to_string(path) {
                    if let Ok(pid) = text.trim().parse() {
                        return pid;
                    }
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap()
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cancel_kills_group_after_leader_exits() {
        let dir = tempdir().unwrap();
        let out = dir.path().display().to_string();
        // 后台进程忽略 SIGTERM 且不持有 stdout，组长收到 SIGTERM 后立即退出
        let program = fake_agent(
            &dir,
            &format!(
                r#"cat > /dev/null
sh -c 'trap "" TERM; exec sleep 30' > /dev/null 2>&1 &
echo $! > "{out}/helper.pid"
echo '{{"type":"thread.started","thread_id":"t-4"}}'
wait"#
            ),
        );

        let cancel = CancellationToken::new();
        let mut session = runner(&program).spawn("x", None, cancel.clone()).await.unwrap();
        let first = timeout(Duration::from_secs(10), session.next_event()).await.unwrap();
        assert!(matches!(first, Some(Event::Started { .. })));
        let helper = read_pid(&dir.path().join("helper.pid")).await;
        // 等 trap 生效
        sleep(Duration::from_millis(200)).await;

        cancel.cancel();
        let events = collect(session).await;
        assert_eq!(completed(&events).status, RunStatus::Cancelled);

        timeout(Duration::from_secs(5), async {
            while !process_gone(helper) {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("忽略 SIGTERM 的后台进程应被 SIGKILL");
    }

    #[tokio::test]
    async fn test_cancel_after_stdout_closed() {
        let dir = tempdir().unwrap();
        // 输出完毕后关闭 stdout，但进程继续运行
        let program = fake_agent(
            &dir,
            r#"cat > /dev/null
echo '{"type":"thread.started","thread_id":"t-5"}'
exec 1>&-
sleep 30"#,
        );

        let cancel = CancellationToken::new();
        let mut session = runner(&program).spawn("x", None, cancel.clone()).await.unwrap();
        let first = timeout(Duration::from_secs(10), session.next_event()).await.unwrap();
        assert!(matches!(first, Some(Event::Started { .. })));
        // 让读取端先看到 EOF
        sleep(Duration::from_millis(200)).await;

        cancel.cancel();
        let mut events = Vec::new();
        timeout(Duration::from_secs(5), async {
            while let Some(event) = session.next_event().await {
                events.push(event);
            }
        })
        .await
        .expect("stdout 关闭后取消仍应结束运行");

        let cancelled = completed(&events);
        assert_eq!(cancelled.status, RunStatus::Cancelled);
        assert_eq!(cancelled.resume, Some(ResumeToken::new("codex", "t-5")));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let dir = tempdir().unwrap();
        let runner = runner(&dir.path().join("does-not-exist"));

        assert!(!runner.is_available());
        let result = runner.spawn("x", None, CancellationToken::new()).await;
        match result {
            Err(Error::Spawn { engine, .. }) => assert_eq!(engine, "codex"),
            Err(other) => panic!("Expected Spawn error, got {}", other),
            Ok(_) => panic!("Expected Spawn error"),
        }
    }
}
