// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use clap::Parser;
use cli::{Cli, Commands, OutputFormatArg};
use shelly_config::AgentMode;
use shelly_input::{parse_frontmatter, parse_workflow, Step, StepQueue};
use shelly_model::catalog::ModelCatalogEntry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(cmd) = &cli.command {
        match cmd {
            Commands::Completions { shell } => {
                cli::print_completions(*shell);
                return Ok(());
            }
            Commands::ShowConfig => {
                let config = shelly_config::load(cli.config.as_deref())?;
                println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
                return Ok(());
            }
            Commands::Validate { file } => {
                return validate_workflow(file);
            }
            Commands::ListModels {
                provider,
                refresh,
                json,
            } => {
                let config = shelly_config::load(cli.config.as_deref())?;
                return list_models_cmd(&config, provider.as_deref(), *refresh, *json).await;
            }
            Commands::ListProviders { verbose, json } => {
                return list_providers_cmd(*verbose, *json);
            }
        }
    }

    let config = Arc::new(shelly_config::load(cli.config.as_deref())?);
    run(cli, config).await
}

// ── Agent construction ────────────────────────────────────────────────────────

/// Build a fully-wired `shelly_core::Agent`: model provider, safety-gated
/// tool registry (filesystem, shell, web, GDB, knowledge/skill discovery),
/// and the runtime context (project root, git/CI notes, discovered skills).
///
/// Returns the agent plus the `mode` lock shared with `SwitchModeTool`, so
/// the caller can apply per-step mode overrides from a workflow file.
async fn build_agent(
    config: &Arc<shelly_config::Config>,
    runtime: shelly_core::AgentRuntimeContext,
    model_override: Option<&str>,
    knowledge: shelly_runtime::SharedKnowledge,
    initial_mode: AgentMode,
) -> anyhow::Result<(shelly_core::Agent, Arc<tokio::sync::Mutex<AgentMode>>)> {
    use shelly_tools::{
        ApplyPatchTool, AskQuestionTool, AutoApprove, DeleteFileTool, EditFileTool, FindFileTool,
        GdbCommandTool, GdbConnectTool, GdbInterruptTool, GdbSessionState, GdbStartServerTool,
        GdbStatusTool, GdbStopTool, GdbWaitStoppedTool, GrepTool, ListDirTool, ListKnowledgeTool,
        LoadSkillTool, NullNotify, PermissionStore, ReadFileTool, ReadImageTool, ReadLintsTool,
        RunTerminalCommandTool, SafetyKernel, SearchCodebaseTool, SearchKnowledgeTool,
        SwitchModeTool, TodoItem, TodoWriteTool, ToolRegistry, UpdateMemoryTool, WebFetchTool,
        WebSearchTool, WriteTool,
    };
    use shelly_config::GdbConfig;
    use tokio::sync::{mpsc, Mutex};

    let model_cfg = match model_override {
        Some(name) => shelly_model::resolve_model_from_config(config, name),
        None => config.model.clone(),
    };
    let model: Arc<dyn shelly_model::ModelProvider> = Arc::from(shelly_model::from_config(&model_cfg)?);
    let max_ctx = model.catalog_context_window().unwrap_or(128_000) as usize;

    let mode = Arc::new(Mutex::new(initial_mode));
    let (tool_tx, tool_rx) = mpsc::channel::<shelly_tools::events::ToolEvent>(64);

    let todos: Arc<Mutex<Vec<TodoItem>>> = Arc::new(Mutex::new(Vec::new()));

    let store = Arc::new(PermissionStore::load_default()?);
    let kernel = SafetyKernel::new(store, Arc::new(AutoApprove), Arc::new(NullNotify));

    let skills: Arc<[shelly_runtime::SkillInfo]> = runtime.skills.get();
    let gdb_state = Arc::new(Mutex::new(GdbSessionState::default()));
    let gdb_cfg = GdbConfig::default();

    let mut registry = ToolRegistry::new();
    registry.register(RunTerminalCommandTool::default());
    registry.register(ReadFileTool);
    registry.register(WriteTool::guarded(kernel.clone()));
    registry.register(EditFileTool::guarded(kernel.clone()));
    registry.register(FindFileTool);
    registry.register(GrepTool);
    registry.register(ListDirTool);
    registry.register(DeleteFileTool::guarded(kernel.clone()));
    registry.register(WebFetchTool::guarded(kernel.clone()));
    registry.register(WebSearchTool {
        api_key: config.tools.web.search.api_key.clone(),
    });
    registry.register(ApplyPatchTool::guarded(kernel.clone()));
    registry.register(ReadLintsTool);
    registry.register(ReadImageTool);
    registry.register(SearchCodebaseTool);
    registry.register(UpdateMemoryTool {
        memory_file: config.tools.memory.memory_file.clone(),
    });
    registry.register(AskQuestionTool::new_headless());
    registry.register(TodoWriteTool::new(todos, tool_tx.clone()));
    registry.register(SwitchModeTool::new(mode.clone(), tool_tx));
    registry.register(LoadSkillTool::new(skills));
    registry.register(ListKnowledgeTool {
        knowledge: knowledge.clone(),
    });
    registry.register(SearchKnowledgeTool { knowledge });
    registry.register(GdbConnectTool::new(gdb_state.clone(), gdb_cfg.clone()));
    registry.register(GdbCommandTool::new(gdb_state.clone(), gdb_cfg.clone()));
    registry.register(GdbStartServerTool::new(gdb_state.clone(), gdb_cfg));
    registry.register(GdbStatusTool::new(gdb_state.clone()));
    registry.register(GdbWaitStoppedTool::new(gdb_state.clone()));
    registry.register(GdbInterruptTool::new(gdb_state.clone()));
    registry.register(GdbStopTool::new(gdb_state));

    let agent = shelly_core::Agent::new(
        model,
        Arc::new(registry),
        Arc::new(config.agent.clone()),
        runtime,
        mode.clone(),
        tool_rx,
        max_ctx,
    );

    Ok((agent, mode))
}

// ── Headless runner ────────────────────────────────────────────────────────────

async fn run(cli: Cli, config: Arc<shelly_config::Config>) -> anyhow::Result<()> {
    let project_root = shelly_runtime::find_project_root().ok();
    let git_context_note = project_root
        .as_deref()
        .map(shelly_runtime::collect_git_context)
        .and_then(|g| g.to_prompt_section());
    let ci_context_note = shelly_runtime::detect_ci_context().to_prompt_section();
    let project_context_file = project_root
        .as_deref()
        .and_then(shelly_runtime::load_project_context_file);
    let skills = shelly_runtime::discover_skills(project_root.as_deref());
    let agents = shelly_runtime::discover_agents(project_root.as_deref());
    let knowledge = shelly_runtime::discover_knowledge(project_root.as_deref());

    let system_prompt_override = match &cli.system_prompt_file {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("reading system prompt file {}", path.display()))?,
        ),
        None => None,
    };

    let runtime = shelly_core::AgentRuntimeContext {
        project_root,
        git_context_note,
        ci_context_note,
        project_context_file,
        append_system_prompt: cli.append_system_prompt.clone(),
        system_prompt_override,
        skills: shelly_runtime::SharedSkills::new(skills),
        agents: shelly_runtime::SharedAgents::new(agents),
    };
    let knowledge = shelly_runtime::SharedKnowledge::new(knowledge);

    let (mut agent, mode_lock) =
        build_agent(&config, runtime, cli.model.as_deref(), knowledge, cli.mode).await?;

    // ── Resolve input: a workflow file, an inline prompt, or stdin ───────────
    let (frontmatter, mut queue) = if let Some(path) = &cli.file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading input file {}", path.display()))?;
        let (fm, body) = parse_frontmatter(&content);
        let wf = parse_workflow(body);
        (fm, wf.steps)
    } else {
        let content = if let Some(p) = &cli.prompt {
            p.clone()
        } else if !is_stdin_tty() {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("reading stdin")?;
            buf
        } else {
            String::new()
        };
        (None, StepQueue::from(vec![Step {
            label: None,
            content,
            options: Default::default(),
        }]))
    };

    if cli.dry_run {
        return match &cli.file {
            Some(path) => validate_workflow(path),
            None => {
                println!("dry run: {} step(s) queued (no --file given)", queue.len());
                Ok(())
            }
        };
    }

    let mut vars: HashMap<String, String> = HashMap::new();
    if let Some(fm) = &frontmatter {
        if let Some(v) = &fm.vars {
            vars.extend(v.clone());
        }
    }
    for spec in &cli.vars {
        match spec.split_once('=') {
            Some((k, v)) => {
                vars.insert(k.to_string(), v.to_string());
            }
            None => eprintln!(
                "[shelly:warn] Ignoring invalid --var argument: {spec:?}  (expected KEY=VALUE)"
            ),
        }
    }

    let total = queue.len();
    let mut i = 0;
    let mut last_text = String::new();

    while let Some(step) = queue.pop() {
        i += 1;

        if let Some(mode_str) = &step.options.mode {
            if let Some(m) = parse_mode(mode_str) {
                *mode_lock.lock().await = m;
            } else {
                eprintln!("[shelly:warn] Unknown mode {mode_str:?} in step {i}/{total}, ignoring");
            }
        }

        if let Some(model_name) = &step.options.model {
            let model_cfg = shelly_model::resolve_model_from_config(&config, model_name);
            match shelly_model::from_config(&model_cfg) {
                Ok(provider) => agent.set_model(Arc::from(provider)),
                Err(e) => eprintln!(
                    "[shelly:warn] Could not switch to model {model_name:?} in step {i}/{total}: {e}"
                ),
            }
        }

        let content = apply_vars(&step.content, &vars);
        if content.trim().is_empty() {
            continue;
        }

        if cli.output_format == OutputFormatArg::Conversation {
            println!("## User\n\n{}\n", content.trim());
        }

        // `submit` streams events through `tx` as it runs; drain concurrently so a
        // turn producing more than the channel's buffer worth of events can't
        // deadlock the agent on a full send.
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let turn = async { tokio::join!(agent.submit(&content, tx), drain_events(rx)) };

        let (submit_result, events) = match step.options.timeout_secs {
            Some(secs) => tokio::time::timeout(std::time::Duration::from_secs(secs), turn)
                .await
                .with_context(|| format!("step {i}/{total} timed out after {secs}s"))?,
            None => turn.await,
        };
        submit_result?;

        let mut turn_text = String::new();
        for ev in events {
            match ev {
                shelly_core::AgentEvent::TextComplete(t) => turn_text.push_str(&t),
                shelly_core::AgentEvent::ToolCallStarted(call) => {
                    eprintln!("[shelly] → {}({})", call.name, call.args);
                }
                shelly_core::AgentEvent::ToolCallFinished {
                    tool_name,
                    is_error,
                    ..
                } => {
                    eprintln!(
                        "[shelly] ← {tool_name} {}",
                        if is_error { "failed" } else { "ok" }
                    );
                }
                shelly_core::AgentEvent::Error(e) => eprintln!("[shelly:error] {e}"),
                _ => {}
            }
        }

        match cli.output_format {
            OutputFormatArg::Conversation => println!("## Shelly\n\n{}\n", turn_text.trim()),
            OutputFormatArg::Compact => println!("{}", turn_text.trim()),
        }

        last_text = turn_text;
    }

    if let Some(path) = &cli.output_last_message {
        std::fs::write(path, &last_text)
            .with_context(|| format!("writing final response to {}", path.display()))?;
    }

    Ok(())
}

/// Drain an event channel into a `Vec`, stopping at `TurnComplete`.
async fn drain_events(
    mut rx: tokio::sync::mpsc::Receiver<shelly_core::AgentEvent>,
) -> Vec<shelly_core::AgentEvent> {
    let mut events = Vec::new();
    while let Some(ev) = rx.recv().await {
        let done = matches!(ev, shelly_core::AgentEvent::TurnComplete);
        events.push(ev);
        if done {
            break;
        }
    }
    events
}

fn parse_mode(s: &str) -> Option<AgentMode> {
    match s {
        "research" => Some(AgentMode::Research),
        "plan" => Some(AgentMode::Plan),
        "agent" => Some(AgentMode::Agent),
        _ => None,
    }
}

/// Substitute `{{KEY}}` placeholders with values from `vars`.
fn apply_vars(content: &str, vars: &HashMap<String, String>) -> String {
    let mut out = content.to_string();
    for (k, v) in vars {
        out = out.replace(&format!("{{{{{k}}}}}"), v);
    }
    out
}

/// Validate a workflow file: parse frontmatter, count steps, report to stdout.
fn validate_workflow(file: &std::path::Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("reading workflow file {}", file.display()))?;

    let (frontmatter, markdown_body) = parse_frontmatter(&content);

    let workflow = parse_workflow(markdown_body);

    // Title: frontmatter overrides H1
    let title = frontmatter
        .as_ref()
        .and_then(|fm| fm.title.as_deref())
        .or(workflow.title.as_deref());
    if let Some(t) = title {
        println!("Title: {t}");
    }

    if let Some(fm) = &frontmatter {
        println!("Frontmatter: OK");
        if let Some(models) = &fm.models {
            println!("  models ({}):", models.len());
            let mut pairs: Vec<_> = models.iter().collect();
            pairs.sort_by_key(|(k, _)| k.as_str());
            for (mode, model) in pairs {
                println!("    {mode}: {model}");
            }
        }
        if let Some(vars) = &fm.vars {
            println!("  vars ({}):", vars.len());
            let mut pairs: Vec<_> = vars.iter().collect();
            pairs.sort_by_key(|(k, _)| k.as_str());
            for (k, v) in pairs {
                println!("    {k} = {v}");
            }
        }
    } else {
        println!("Frontmatter: (none)");
    }

    if let Some(preamble) = &workflow.system_prompt_append {
        println!(
            "Preamble: {} chars (appended to system prompt)",
            preamble.chars().count()
        );
    }

    let mut queue = workflow.steps;
    let total = queue.len();
    println!("Steps: {total}");

    let mut i = 0;
    while let Some(step) = queue.pop() {
        i += 1;
        let label = step.label.as_deref().unwrap_or("(unlabelled)");
        let mode = step.options.mode.as_deref().unwrap_or("(inherit)");
        let provider = step.options.provider.as_deref().unwrap_or("(inherit)");
        let model = step.options.model.as_deref().unwrap_or("(inherit)");
        let timeout = step
            .options
            .timeout_secs
            .map(|t| format!("{t}s"))
            .unwrap_or_else(|| "(inherit)".to_string());
        println!("  Step {i}/{total}: {label:?}  mode={mode}  provider={provider}  model={model}  timeout={timeout}");
        if !step.content.is_empty() {
            let preview = step.content.chars().take(80).collect::<String>();
            let ellipsis = if step.content.chars().count() > 80 {
                "…"
            } else {
                ""
            };
            println!("    {preview}{ellipsis}");
        }
    }

    println!("\nWorkflow is valid.");
    Ok(())
}

/// List available models, optionally querying the provider API for live data.
async fn list_models_cmd(
    config: &shelly_config::Config,
    provider_filter: Option<&str>,
    refresh: bool,
    as_json: bool,
) -> anyhow::Result<()> {
    // Validate provider filter against the registry.
    if let Some(prov) = provider_filter {
        if shelly_model::get_driver(prov).is_none() {
            eprintln!("Unknown provider: {prov:?}");
            eprintln!("\nAvailable providers (run `shelly list-providers` for details):");
            for d in shelly_model::list_drivers() {
                eprintln!("  {:20} {}", d.id, d.name);
            }
            anyhow::bail!("Invalid provider: {prov}");
        }
    }

    let entries: Vec<ModelCatalogEntry> = if refresh {
        // Query the configured (or filtered) provider's live API.
        let model_cfg = if let Some(prov) = provider_filter {
            let mut c = config.model.clone();
            c.provider = prov.to_string();
            c
        } else {
            config.model.clone()
        };
        let model = shelly_model::from_config(&model_cfg)?;
        let mut live = model.list_models().await?;
        if let Some(prov) = provider_filter {
            live.retain(|e| e.provider == prov);
        }
        live
    } else {
        // Use static catalog only.
        let mut all = shelly_model::catalog::static_catalog();
        if let Some(prov) = provider_filter {
            all.retain(|e| e.provider == prov);
        }
        all.sort_by(|a, b| a.provider.cmp(&b.provider).then(a.id.cmp(&b.id)));
        all
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No models found.");
        return Ok(());
    }

    // Determine column widths.
    let id_w = entries
        .iter()
        .map(|e| e.id.len())
        .max()
        .unwrap_or(10)
        .max(10);
    let prov_w = entries
        .iter()
        .map(|e| e.provider.len())
        .max()
        .unwrap_or(8)
        .max(8);

    println!(
        "{:<id_w$}  {:<prov_w$}  {:>12}  {:>16}  DESCRIPTION",
        "ID",
        "PROVIDER",
        "CTX WINDOW",
        "MAX OUT TOKENS",
        id_w = id_w,
        prov_w = prov_w,
    );
    println!("{}", "-".repeat(id_w + prov_w + 50));

    for e in &entries {
        let ctx = if e.context_window == 0 {
            "  -".to_string()
        } else {
            format!("{:>12}", e.context_window)
        };
        let max_out = if e.max_output_tokens == 0 {
            "  -".to_string()
        } else {
            format!("{:>16}", e.max_output_tokens)
        };
        println!(
            "{:<id_w$}  {:<prov_w$}  {}  {}  {}",
            e.id,
            e.provider,
            ctx,
            max_out,
            e.description,
            id_w = id_w,
            prov_w = prov_w,
        );
    }
    println!("\nTotal: {} model(s)", entries.len());
    Ok(())
}

/// List all registered model providers.
fn list_providers_cmd(verbose: bool, as_json: bool) -> anyhow::Result<()> {
    let drivers = shelly_model::list_drivers();

    if as_json {
        #[derive(serde::Serialize)]
        struct ProviderJson {
            id: &'static str,
            name: &'static str,
            description: &'static str,
            default_api_key_env: Option<&'static str>,
            default_base_url: Option<&'static str>,
            requires_api_key: bool,
        }
        let rows: Vec<ProviderJson> = drivers
            .iter()
            .map(|d| ProviderJson {
                id: d.id,
                name: d.name,
                description: d.description,
                default_api_key_env: d.default_api_key_env,
                default_base_url: d.default_base_url,
                requires_api_key: d.requires_api_key,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("Supported Model Providers ({} total)\n", drivers.len());

    if verbose {
        for d in drivers {
            println!("  {} — {}", d.id, d.name);
            println!("    {}", d.description);
            if let Some(env) = d.default_api_key_env {
                println!("    API key env : {env}");
            }
            if let Some(url) = d.default_base_url {
                println!("    Default URL : {url}");
            }
            if !d.requires_api_key {
                println!("    Auth        : none required");
            }
            println!();
        }
    } else {
        let id_w = drivers
            .iter()
            .map(|d| d.id.len())
            .max()
            .unwrap_or(10)
            .max(10);
        let name_w = drivers
            .iter()
            .map(|d| d.name.len())
            .max()
            .unwrap_or(8)
            .max(8);
        println!("{:<id_w$}  {:<name_w$}  DESCRIPTION", "ID", "NAME");
        println!("{}", "-".repeat(id_w + name_w + 40));
        for d in drivers {
            println!("{:<id_w$}  {:<name_w$}  {}", d.id, d.name, d.description);
        }
        println!("\nUse `shelly list-providers --verbose` for API key and URL details.");
        println!("Use `shelly list-models --provider <ID>` to see models for a specific provider.");
    }
    Ok(())
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

fn is_stdin_tty() -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        unsafe { libc::isatty(io::stdin().as_raw_fd()) != 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}
