//! Shared fixtures for the integration tests

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tailwatch::{
    actors::{client::ClientServices, manager::ManagerHandle},
    config::{Config, parse_config},
    filter::lua::LuaLoader,
    ssh::{OutputSink, SshConnector, SshSession, SshTarget},
};

/// `check_error` gates on "ERROR"; `check_unknown` matches while no line
/// mentioned "known", so every gated line counts until then
pub const SCRIPT: &str = r#"
    known = 0

    function check_error(line)
        return string.find(line, "ERROR", 1, true) ~= nil
    end

    function check_unknown(line)
        if string.find(line, " known", 1, true) then
            known = known + 1
        end
        return known == 0, "unknown"
    end

    function check_noisy(line)
        if string.find(line, "noisy", 1, true) then
            return true, "", true
        end
        return false
    end

    function summary_unknown()
        return "known:" .. known
    end
"#;

pub const ADMIN_USER: &str = "admin";
pub const ADMIN_PWD: &str = "secret";

/// Connector whose remote agents never exit; counts connection attempts
#[derive(Default)]
pub struct IdleSsh {
    pub connects: AtomicUsize,
}

struct IdleSession;

#[async_trait]
impl SshConnector for IdleSsh {
    async fn connect(&self, _target: &SshTarget) -> anyhow::Result<Box<dyn SshSession>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(IdleSession))
    }
}

#[async_trait]
impl SshSession for IdleSession {
    async fn run(&mut self, command: &str, _output: OutputSink<'_>) -> anyhow::Result<i32> {
        if command.starts_with("./") {
            std::future::pending::<()>().await;
        }
        Ok(0)
    }
}

pub fn file(name: &str) -> Value {
    json!({
        "name": name,
        "path": format!("/var/log/{name}.log"),
        "ssh_host": "10.0.0.2",
        "ssh_port": 22,
        "ssh_user": "deploy",
        "ssh_pwd": "hunter2"
    })
}

pub fn target(id: &str, open: bool, files: &[&str]) -> Value {
    json!({
        "id": id,
        "open": open,
        "filters": ["err"],
        "files": files.iter().map(|name| file(name)).collect::<Vec<_>>()
    })
}

/// Filter `err` with the sub filters named by `subs`, each backed by
/// `check_<id>` and keeping `amount` entries
pub fn err_filter(subs: &[(&str, usize)]) -> Value {
    let sub_filters: Vec<_> = subs
        .iter()
        .map(|(id, amount)| {
            json!({
                "id": id,
                "amount": amount,
                "check_function_name": format!("check_{id}"),
                "summary_function_name": if *id == "unknown" { "summary_unknown" } else { "" }
            })
        })
        .collect();
    json!({
        "id": "err",
        "desc": "errors",
        "script": SCRIPT,
        "check_function_name": "check_error",
        "sub_filters": sub_filters
    })
}

pub fn raw_config(targets: Vec<Value>, filter: Value) -> String {
    serde_json::to_string_pretty(&json!({
        "address": "127.0.0.1",
        "port": 0,
        "reload_seconds": 3600,
        "admin_user": ADMIN_USER,
        "admin_pwd": ADMIN_PWD,
        "targets": targets,
        "filters": [filter]
    }))
    .unwrap()
}

/// Config with target `web1` (file `app`) and the `err` / `unknown` pair
pub fn web1_config() -> String {
    raw_config(
        vec![target("web1", true, &["app"])],
        err_filter(&[("unknown", 2)]),
    )
}

pub fn parse(raw: &str) -> Config {
    parse_config(raw).unwrap()
}

pub fn services(ssh: Arc<IdleSsh>) -> ClientServices {
    ClientServices {
        loader: Arc::new(LuaLoader::new()),
        connector: ssh,
    }
}

/// Spawn a manager and apply `raw`
pub async fn spawn_manager(raw: &str, config_path: Option<PathBuf>) -> ManagerHandle {
    let manager = ManagerHandle::spawn(services(Arc::default()), config_path);
    manager
        .build(parse(raw), raw.to_string())
        .await
        .expect("initial build");
    manager
}

/// Poll `check` until it holds, panicking after about two seconds
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
