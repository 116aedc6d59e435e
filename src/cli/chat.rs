use std::sync::Arc;

use anyhow::Result;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

use super::render;
use crate::backend::{ChatBackend, HttpBackend};
use crate::compare::{
    Comparison, Confirmation, LifecycleError, Operation, Registry, Role, SessionController,
};
use crate::core::AppConfig;

const HELP: &str = "\
/models                 list available models
/select <model>...      compare exactly these models
/add <model>            add a model
/swap <pane> <model>    switch a pane to another model
/clear <pane>           clear a pane's conversation
/delete <pane>          close a pane
/system [prompt]        set or unset the system prompt
/image [path]           attach an image to the next prompt
/panes                  show every pane
/quit                   exit
Anything else is sent to every pane.";

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Prompt(String),
    Models,
    Select(Vec<String>),
    Add(String),
    Swap(String, String),
    Clear(String),
    Delete(String),
    System(Option<String>),
    Image(Option<String>),
    Panes,
    Help,
    Quit,
    Invalid(String),
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    let Some(command) = line.strip_prefix('/') else {
        return Input::Prompt(line.to_string());
    };
    let (name, rest) = command
        .split_once(char::is_whitespace)
        .map(|(name, rest)| (name, rest.trim()))
        .unwrap_or((command, ""));
    let args: Vec<&str> = rest.split_whitespace().collect();
    let optional = || Some(rest.to_string()).filter(|r| !r.is_empty());

    match (name, args.as_slice()) {
        ("models", []) => Input::Models,
        ("select", [_, ..]) => Input::Select(args.iter().map(|a| a.to_string()).collect()),
        ("add", [model]) => Input::Add(model.to_string()),
        ("swap", [pane, model]) => Input::Swap(pane.to_string(), model.to_string()),
        ("clear", [pane]) => Input::Clear(pane.to_string()),
        ("delete", [pane]) => Input::Delete(pane.to_string()),
        ("system", _) => Input::System(optional()),
        ("image", _) => Input::Image(optional()),
        ("panes", []) => Input::Panes,
        ("help", _) => Input::Help,
        ("quit", _) | ("exit", _) => Input::Quit,
        _ => Input::Invalid(line.to_string()),
    }
}

/// Find a session by its 1-based pane number or its id.
fn resolve_pane(registry: &Registry, pane: &str) -> Option<String> {
    if let Ok(n) = pane.parse::<usize>() {
        return registry
            .sessions()
            .nth(n.checked_sub(1)?)
            .map(|s| s.id.clone());
    }
    registry
        .sessions()
        .find(|s| s.id == pane)
        .map(|s| s.id.clone())
}

enum Action {
    Swap { session_id: String, model_id: String },
    Clear(String),
    Delete(String),
}

async fn perform<B: ChatBackend + ?Sized>(
    controller: &SessionController<B>,
    action: &Action,
    confirmation: Confirmation,
) -> Result<(), LifecycleError> {
    match action {
        Action::Swap {
            session_id,
            model_id,
        } => {
            controller
                .change_model(session_id, model_id, confirmation)
                .await
        }
        Action::Clear(session_id) => controller.clear(session_id, confirmation).await,
        Action::Delete(session_id) => controller.delete(session_id, confirmation).await,
    }
}

fn question(operation: Operation) -> &'static str {
    match operation {
        Operation::ChangeModel => "Switching models discards this conversation. Continue?",
        Operation::Clear => "Clear this conversation?",
        Operation::Delete => "Close this pane?",
        Operation::Create | Operation::Reselect => "Continue?",
    }
}

fn ask(rl: &mut DefaultEditor, question: &str) -> Result<bool> {
    match rl.readline(&format!("{} [y/N] ", question)) {
        Ok(answer) => Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")),
        Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Run `action`, asking the user first when it needs confirming.
async fn run_confirmed<B: ChatBackend + ?Sized>(
    rl: &mut DefaultEditor,
    controller: &SessionController<B>,
    action: Action,
) -> Result<()> {
    let result = match perform(controller, &action, Confirmation::Unconfirmed).await {
        Err(LifecycleError::ConfirmationRequired(operation)) => {
            if ask(rl, question(operation))? {
                perform(controller, &action, Confirmation::Confirmed).await
            } else {
                println!("Cancelled");
                Ok(())
            }
        }
        result => result,
    };
    if let Err(e) = result {
        println!("Error: {}", e);
    }
    Ok(())
}

fn print_latest_answers(registry: &Registry) {
    for (i, session) in registry.sessions().enumerate() {
        let name = registry.catalog().display_name(&session.model_id);
        match session.transcript.last() {
            Some(message) if message.role == Role::Assistant => {
                println!("── {}. {} ──\n{}\n", i + 1, name, message.content)
            }
            _ => {}
        }
        if let Some(error) = &session.last_error {
            println!("── {}. {} ──\n! {}\n", i + 1, name, error);
        }
    }
}

pub async fn run(config: &AppConfig, models: &[String]) -> Result<()> {
    let mut rl = DefaultEditor::new()?;

    let backend = Arc::new(HttpBackend::new(&config.api_url)?);
    let comparison = Comparison::new(backend, config.dispatch_config(), config.max_sessions);
    let controller = comparison.sessions();
    controller.set_system_prompt(config.system_prompt.clone());

    if models.is_empty() {
        comparison.bootstrap().await?;
    } else {
        controller.refresh_catalog().await?;
        controller.reselect(models).await?;
    }
    println!("{}", render::panes(&comparison.snapshot()));
    println!("Type /help for commands");

    let mut image: Option<String> = None;

    loop {
        let readline = rl.readline(">>> ");
        let line = match readline {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => break,
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                println!("Error: {:?}", err);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let _ = rl.add_history_entry(line.as_str());
        let registry = comparison.snapshot();

        match parse_input(&line) {
            Input::Prompt(prompt) => {
                let sent = render::submit(&comparison, &prompt, image.as_deref()).await;
                match sent {
                    Ok(_) => {
                        image = None;
                        print_latest_answers(&comparison.snapshot());
                    }
                    Err(e) => println!("Not sent: {}", e),
                }
            }
            Input::Models => print!("{}", render::catalog(registry.catalog())),
            Input::Select(models) => match controller.reselect(&models).await {
                Ok(report) => {
                    for (session_id, e) in report.errors {
                        println!("Session {} may not be ready: {}", session_id, e);
                    }
                    println!("{}", render::panes(&comparison.snapshot()));
                }
                Err(e) => println!("Error: {}", e),
            },
            Input::Add(model) => match controller.create(&model).await {
                Ok(_) => println!("{}", render::panes(&comparison.snapshot())),
                Err(e) => println!("Error: {}", e),
            },
            Input::Swap(pane, model_id) => match resolve_pane(&registry, &pane) {
                Some(session_id) => {
                    let action = Action::Swap {
                        session_id,
                        model_id,
                    };
                    run_confirmed(&mut rl, controller, action).await?;
                }
                None => println!("No pane {}", pane),
            },
            Input::Clear(pane) => match resolve_pane(&registry, &pane) {
                Some(session_id) => {
                    run_confirmed(&mut rl, controller, Action::Clear(session_id)).await?
                }
                None => println!("No pane {}", pane),
            },
            Input::Delete(pane) => match resolve_pane(&registry, &pane) {
                Some(session_id) => {
                    run_confirmed(&mut rl, controller, Action::Delete(session_id)).await?
                }
                None => println!("No pane {}", pane),
            },
            Input::System(prompt) => {
                match &prompt {
                    Some(p) => println!("System prompt set to: {}", p),
                    None => println!("System prompt unset"),
                }
                controller.set_system_prompt(prompt);
            }
            Input::Image(path) => match path.as_deref().map(render::load_image).transpose() {
                Ok(loaded) => {
                    image = loaded;
                    match image {
                        Some(_) => println!("Image attached to the next prompt"),
                        None => println!("Image removed"),
                    }
                }
                Err(e) => println!("Error: {}", e),
            },
            Input::Panes => println!("{}", render::panes(&registry)),
            Input::Help => println!("{}", HELP),
            Input::Quit => break,
            Input::Invalid(line) => println!("Unknown command: {}\n{}", line, HELP),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::Session;

    #[test]
    fn test_parse_input() {
        assert_eq!(
            parse_input("  What is Rust? "),
            Input::Prompt("What is Rust?".to_string())
        );
        assert_eq!(
            parse_input("/select gpt-4o claude"),
            Input::Select(vec!["gpt-4o".to_string(), "claude".to_string()])
        );
        assert_eq!(
            parse_input("/swap 2 claude"),
            Input::Swap("2".to_string(), "claude".to_string())
        );
        assert_eq!(
            parse_input("/system Answer in   French"),
            Input::System(Some("Answer in   French".to_string()))
        );
        assert_eq!(parse_input("/system"), Input::System(None));
        assert_eq!(parse_input("/quit"), Input::Quit);
        assert!(matches!(parse_input("/swap 2"), Input::Invalid(_)));
        assert!(matches!(parse_input("/select"), Input::Invalid(_)));
    }

    #[test]
    fn test_resolve_pane() {
        let registry = Registry::default()
            .with_session(Session::with_id("abc", "a"))
            .with_session(Session::with_id("def", "b"));
        assert_eq!(resolve_pane(&registry, "2").as_deref(), Some("def"));
        assert_eq!(resolve_pane(&registry, "abc").as_deref(), Some("abc"));
        assert_eq!(resolve_pane(&registry, "0"), None);
        assert_eq!(resolve_pane(&registry, "3"), None);
    }
}
