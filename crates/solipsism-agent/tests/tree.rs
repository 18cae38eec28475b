//! End-to-end runs of a small context tree with scripted models.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use solipsism_agent::{ContextRequest, ContextState, Manager, ManagerSettings, ToolCatalog, ToolConfig};
use solipsism_core::lpml::Element;
use solipsism_core::types::Message;
use solipsism_providers::{LlmProvider, ModelSettings, ProviderError, ProviderFactory};

/// Replays a fixed list of replies, then keeps finishing.
struct ScriptedProvider {
    replies: Mutex<Vec<String>>,
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn generate(&self, _history: &[Message]) -> Message {
        let mut replies = self.replies.lock().unwrap();
        if replies.is_empty() {
            Message::assistant("<finish/>")
        } else {
            Message::assistant(replies.remove(0))
        }
    }

    fn model(&self) -> &str {
        "scripted"
    }

    fn display_name(&self) -> &str {
        "Scripted"
    }
}

/// Hands out a fresh script per model name; no model means `"root"`.
struct ScriptedFactory {
    scripts: HashMap<String, Vec<String>>,
}

impl ScriptedFactory {
    fn new(scripts: &[(&str, &[&str])]) -> Arc<Self> {
        Arc::new(Self {
            scripts: scripts
                .iter()
                .map(|(model, replies)| {
                    (model.to_string(), replies.iter().map(|r| r.to_string()).collect())
                })
                .collect(),
        })
    }
}

impl ProviderFactory for ScriptedFactory {
    fn build(&self, settings: &ModelSettings) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        let model = settings.model.as_deref().unwrap_or("root");
        let replies = self
            .scripts
            .get(model)
            .cloned()
            .ok_or_else(|| ProviderError::NotConfigured(model.to_string()))?;
        Ok(Arc::new(ScriptedProvider {
            replies: Mutex::new(replies),
        }))
    }
}

fn manager(factory: Arc<ScriptedFactory>, workspace: &std::path::Path) -> Arc<Manager> {
    let prompt = workspace.join("prompt.lpml");
    std::fs::write(&prompt, "<rule>Be helpful.</rule>").unwrap();
    let catalog = ToolCatalog::builtin(ToolConfig {
        workspace: workspace.to_path_buf(),
        restrict_to_workspace: true,
        shell_timeout: Duration::from_secs(5),
    });
    Manager::new(
        catalog,
        factory,
        ManagerSettings {
            max_turns: 10,
            turn_sleep: Duration::ZERO,
            result_timeout: Duration::from_secs(2),
            prompt_path: prompt,
        },
    )
}

async fn start_root(manager: &Arc<Manager>, tools: &[&str]) -> Arc<solipsism_agent::Context> {
    let root = manager
        .build_context(&ContextRequest {
            parent_id: "user".into(),
            task: String::new(),
            tool_names: tools.iter().map(|t| t.to_string()).collect(),
            custom_id: Some("root".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    manager.spawn(Arc::clone(&root), "Introduce yourself.".into());
    root
}

async fn wait_for_state(ctx: &solipsism_agent::Context, state: ContextState) {
    for _ in 0..500 {
        if ctx.state() == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("context {} stuck in {:?}", ctx.id(), ctx.state());
}

fn history_contains(ctx: &solipsism_agent::Context, needle: &str) -> bool {
    ctx.history().iter().any(|e| e.to_string().contains(needle))
}

#[tokio::test]
async fn test_parent_child_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("notes.txt"), "the notes say hi").unwrap();

    let factory = ScriptedFactory::new(&[
        (
            "root",
            &[
                r#"<create_context id="worker"><llm model="worker"/><tools><tool name="read_file"/></tools><task>Read notes.txt and report back.</task></create_context>"#,
                "<wait/>",
                r#"<send to="parent">All done.</send>"#,
                "<finish/>",
            ],
        ),
        (
            "worker",
            &[
                r#"<read_file path="notes.txt"/>"#,
                r#"<send to="parent">Report: the notes say hi</send>"#,
                "<finish/>",
            ],
        ),
    ]);
    let manager = manager(factory, dir.path());
    let user = manager.add_endpoint("user").unwrap();
    let root = start_root(&manager, &["list_files"]).await;

    let delivered = user
        .system()
        .recv_timeout(Duration::from_secs(10))
        .await
        .expect("root should report to the user");
    assert_eq!(delivered.tag, "send");
    assert_eq!(delivered.get_attr("from"), Some("root"));
    assert_eq!(delivered.get_attr("to"), Some("user"));
    assert_eq!(delivered.text(), "All done.");

    wait_for_state(&root, ContextState::Terminated).await;
    let worker = manager.get_context("worker").expect("worker registered");
    wait_for_state(&worker, ContextState::Terminated).await;

    assert_eq!(root.child_ids(), vec!["worker"]);
    assert_eq!(worker.parent_id(), Some("root"));
    assert_eq!(
        worker.system().tool_names(),
        vec!["read_file", "send", "create_context"]
    );
    assert!(history_contains(&root, r#"<output tool="create_context" id="worker" status="success">"#));
    assert!(history_contains(&root, "Report: the notes say hi"));
    assert!(history_contains(&worker, "the notes say hi"));
    assert!(history_contains(&worker, "Your parent is your sole point of contact."));
}

#[tokio::test]
async fn test_send_to_grandparent_is_denied() {
    let dir = tempfile::tempdir().unwrap();
    let factory = ScriptedFactory::new(&[
        (
            "root",
            &[
                r#"<create_context id="leaf"><llm model="leaf"/><task>Try to reach the user.</task></create_context>"#,
                "<wait/>",
            ],
        ),
        ("leaf", &[r#"<send to="user">skip the line</send>"#, "<finish/>"]),
    ]);
    let manager = manager(factory, dir.path());
    let user = manager.add_endpoint("user").unwrap();
    let root = start_root(&manager, &[]).await;

    let leaf = loop {
        if let Some(leaf) = manager.get_context("leaf") {
            break leaf;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    wait_for_state(&leaf, ContextState::Terminated).await;

    assert!(history_contains(&leaf, r#"<output tool="send" to="user" status="error">"#));
    assert!(history_contains(&leaf, "permission denied"));
    assert!(!user.system().has_pending());

    wait_for_state(&root, ContextState::Waiting).await;
    manager.shutdown();
    wait_for_state(&root, ContextState::Terminated).await;
}

#[tokio::test]
async fn test_create_context_failure_reported_to_parent() {
    let dir = tempfile::tempdir().unwrap();
    let factory = ScriptedFactory::new(&[(
        "root",
        &[
            r#"<create_context><llm model="unknown-model"/><task>x</task></create_context>"#,
            "<finish/>",
        ],
    )]);
    let manager = manager(factory, dir.path());
    manager.add_endpoint("user").unwrap();
    let root = start_root(&manager, &[]).await;

    wait_for_state(&root, ContextState::Terminated).await;
    assert!(history_contains(&root, r#"<output tool="create_context" status="error">"#));
    assert!(history_contains(&root, "Failed to create context."));
    assert_eq!(manager.context_ids(), vec!["root", "user"]);
}

#[tokio::test]
async fn test_user_endpoint_reaches_root() {
    let dir = tempfile::tempdir().unwrap();
    let factory = ScriptedFactory::new(&[(
        "root",
        &["<wait/>", r#"<send to="parent">echo</send>"#, "<finish/>"],
    )]);
    let manager = manager(factory, dir.path());
    let user = manager.add_endpoint("user").unwrap();
    let root = start_root(&manager, &[]).await;
    wait_for_state(&root, ContextState::Waiting).await;

    let send = user.system().get_tool("send").expect("endpoint has send");
    let out = send
        .run(
            &Element::with_text("send", "hello root").attr("to", "root"),
            &solipsism_agent::tools::Invocation::new("user"),
        )
        .await
        .unwrap();
    assert_eq!(out.attributes.get("status"), Some("success"));

    let reply = user
        .system()
        .recv_timeout(Duration::from_secs(10))
        .await
        .expect("root answers");
    assert_eq!(reply.text(), "echo");
    wait_for_state(&root, ContextState::Terminated).await;
    assert!(history_contains(&root, r#"<send from="user" to="root">hello root</send>"#));
}
