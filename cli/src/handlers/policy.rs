use super::{HandlerResult, load_policy};

pub fn handle_policy(path: Option<String>) -> HandlerResult {
    let policy = load_policy(path.as_deref())?;
    println!("{}", serde_json::to_string_pretty(&policy)?);
    Ok(())
}
