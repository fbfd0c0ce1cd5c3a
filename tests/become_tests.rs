//! Privilege escalation tests
//!
//! Checks the command rewriting for each method and where escalation is
//! applied: on the connection (inventory or configuration) or per task.

mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;

use common::*;
use convoy::config::Config;
use convoy::connection::{BaseConnection, BecomeMethod, Connection, ConnectionConfig};
use convoy::executor::{ExecutionContext, Task, TaskStatus};

fn escalated(method: &str, user: Option<&str>) -> BaseConnection {
    BaseConnection::new(
        ConnectionConfig::new("web1").with_become(method, user.map(String::from)),
    )
}

#[test]
fn test_sudo_wraps_command() {
    assert_eq!(
        escalated("sudo", Some("root")).apply_become("whoami"),
        "sudo -u root whoami"
    );
    assert_eq!(escalated("sudo", None).apply_become("whoami"), "sudo whoami");
}

#[test]
fn test_su_quotes_command() {
    assert_eq!(
        escalated("su", Some("root")).apply_become("whoami"),
        "su - root -c 'whoami'"
    );
    assert_eq!(
        escalated("su", Some("postgres")).apply_become("echo 'hi'"),
        "su - postgres -c 'echo '\\''hi'\\'''"
    );
}

#[test]
fn test_other_methods() {
    assert_eq!(
        escalated("doas", Some("admin")).apply_become("id"),
        "doas -u admin id"
    );
    assert_eq!(escalated("pbrun", Some("admin")).apply_become("id"), "pbrun id");
    assert_eq!(BecomeMethod::parse(""), BecomeMethod::Sudo);
    assert_eq!(BecomeMethod::parse("SU"), BecomeMethod::Su);
}

#[test]
fn test_disabled_become_is_identity() {
    let base = BaseConnection::new(ConnectionConfig::new("web1"));
    assert_eq!(base.apply_become("whoami"), "whoami");
}

#[tokio::test]
async fn test_escalated_connection_rewrites_every_command() {
    let conn = MockConnection::new(
        ConnectionConfig::new("web1").with_become("sudo", Some("root".into())),
    );
    conn.connect().await.unwrap();

    conn.execute("whoami", None).await.unwrap();
    conn.execute("id -u", None).await.unwrap();

    assert_eq!(conn.commands(), vec!["sudo -u root whoami", "sudo -u root id -u"]);
}

#[tokio::test]
async fn test_task_level_become() {
    let h = permissive_harness();
    let task = Task::new("command", "web1")
        .arg("cmd", "whoami")
        .connection("mock")
        .r#become("sudo", Some("root".into()));

    let result = h
        .executor
        .execute_task(&task, &ExecutionContext::default())
        .await
        .unwrap();

    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(h.transport.commands(), vec!["sudo -u root whoami"]);
}

#[tokio::test]
async fn test_task_without_become_runs_plain() {
    let h = permissive_harness();
    let task = Task::new("command", "web1")
        .arg("cmd", "whoami")
        .connection("mock");

    h.executor
        .execute_task(&task, &ExecutionContext::default())
        .await
        .unwrap();

    assert_eq!(h.transport.commands(), vec!["whoami"]);
}

#[tokio::test]
async fn test_inventory_become_applies_on_connection() {
    let h = permissive_harness();
    let ctx = ExecutionContext::default()
        .with_host_var("ansible_become", "yes")
        .with_host_var("ansible_become_method", "su")
        .with_host_var("ansible_become_user", "deploy");
    let task = Task::new("command", "web1")
        .arg("cmd", "whoami")
        .connection("mock");

    h.executor.execute_task(&task, &ctx).await.unwrap();

    assert_eq!(h.transport.commands(), vec!["su - deploy -c 'whoami'"]);
}

#[tokio::test]
async fn test_connection_and_task_become_wrap_once() {
    let h = permissive_harness();
    let ctx = ExecutionContext::default()
        .with_group_var("ansible_become", true)
        .with_group_var("ansible_become_user", "root");
    let task = Task::new("shell", "web1")
        .arg("cmd", "whoami")
        .connection("mock")
        .r#become("sudo", Some("root".into()));

    h.executor.execute_task(&task, &ctx).await.unwrap();

    let commands = h.transport.commands();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].matches("sudo").count(), 1, "{:?}", commands);
}

#[tokio::test]
async fn test_configured_escalation_defaults() {
    let h = permissive_harness();
    let mut config = Config::default();
    config.privilege_escalation.r#become = true;
    config.privilege_escalation.become_method = "doas".into();
    config.privilege_escalation.become_user = "operator".into();
    let ctx = ExecutionContext::new(Arc::new(config));
    let task = Task::new("command", "web1")
        .arg("cmd", "whoami")
        .connection("mock");

    h.executor.execute_task(&task, &ctx).await.unwrap();

    assert_eq!(h.transport.commands(), vec!["doas -u operator whoami"]);
}

#[tokio::test]
async fn test_task_become_escalates_whole_chdir_script() {
    let h = permissive_harness();
    let task = Task::new("command", "web1")
        .arg("cmd", "pwd")
        .arg("chdir", "/tmp")
        .connection("mock")
        .r#become("sudo", Some("root".into()));

    h.executor
        .execute_task(&task, &ExecutionContext::default())
        .await
        .unwrap();

    assert_eq!(
        h.transport.commands(),
        vec![r"sudo -u root /bin/sh -c 'cd '\''/tmp'\'' && pwd'"]
    );
}

#[tokio::test]
async fn test_escalated_connection_wraps_compound_commands() {
    let conn = MockConnection::new(
        ConnectionConfig::new("web1").with_become("doas", Some("admin".into())),
    );
    conn.connect().await.unwrap();

    conn.execute("mkdir -p /srv && chmod 755 /srv", None).await.unwrap();

    assert_eq!(
        conn.commands(),
        vec!["doas -u admin /bin/sh -c 'mkdir -p /srv && chmod 755 /srv'"]
    );
}
