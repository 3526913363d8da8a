//! Deployment template rendering
//!
//! Placeholders are replaced by literal substring substitution; nothing is
//! evaluated. Unknown `{{...}}` tokens pass through untouched.

use conveyor_models::{DeployTask, Environment, Project};

pub const IMAGE_TAG: &str = "{{IMAGE_TAG}}";
pub const NAMESPACE: &str = "{{NAMESPACE}}";
pub const PROJECT_NAME: &str = "{{PROJECT_NAME}}";
pub const ENV_NAME: &str = "{{ENV_NAME}}";

/// Values substituted into a deployment template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderContext {
    pub image_tag: String,
    pub namespace: String,
    pub project_name: String,
    pub env_name: String,
}

impl RenderContext {
    /// Context for a task; missing or unnamed reference records fall back to
    /// `project-<id>` and `env-<id>`
    pub fn for_task(
        task: &DeployTask,
        project: Option<&Project>,
        environment: Option<&Environment>,
    ) -> Self {
        let project_name = project
            .map(|p| p.name.trim())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("project-{}", task.project_id));
        let env_name = environment
            .map(|e| e.name.trim())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("env-{}", task.env_id));

        Self {
            image_tag: task.image_tag.clone(),
            namespace: task.namespace.clone(),
            project_name,
            env_name,
        }
    }
}

/// Turn escaped `\n` sequences, CRLF and lone CR into LF
pub fn normalize_newlines(text: &str) -> String {
    text.replace("\\n", "\n")
        .replace("\r\n", "\n")
        .replace('\r', "\n")
}

pub fn render(template: &str, ctx: &RenderContext) -> String {
    normalize_newlines(template)
        .replace(IMAGE_TAG, &ctx.image_tag)
        .replace(NAMESPACE, &ctx.namespace)
        .replace(PROJECT_NAME, &ctx.project_name)
        .replace(ENV_NAME, &ctx.env_name)
}

fn is_separator(line: &str) -> bool {
    let line = line.trim_end();
    line == "---" || line.starts_with("--- ")
}

/// Split a rendered multi-document YAML stream on `---` lines
///
/// Whitespace-only documents are dropped, the rest are returned trimmed and in
/// order.
pub fn split_documents(rendered: &str) -> Vec<String> {
    let mut documents = Vec::new();
    let mut current = String::new();

    for line in rendered.lines() {
        if is_separator(line) {
            push_document(&mut documents, &mut current);
            continue;
        }
        current.push_str(line);
        current.push('\n');
    }
    push_document(&mut documents, &mut current);

    documents
}

fn push_document(documents: &mut Vec<String>, current: &mut String) {
    let doc = current.trim();
    if !doc.is_empty() {
        documents.push(doc.to_string());
    }
    current.clear();
}
