//! The admin command set.

use super::grammar::{
    ArgKind, Arguments, CommandError, CommandResult, Dispatcher, Node, Privilege, Reply,
};
use crate::engine::ProxyEngine;
use crate::state::Shutdown;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use quarry_core::UpstreamSource;
use rand_core::RngCore;
use std::sync::Arc;
use tracing::info;

/// Everything a command executor can reach.
#[derive(Clone)]
pub struct CommandContext {
    pub engine: ProxyEngine,
    pub shutdown: Shutdown,
    pub dispatcher: Arc<Dispatcher<CommandContext>>,
    pub privilege: Privilege,
}

/// Build the console grammar.
pub fn build_dispatcher() -> Dispatcher<CommandContext> {
    let mut d = Dispatcher::new();

    d.register(
        Node::literal_with_aliases("help", &["h", "?"])
            .describe("Show usage for all or some commands")
            .executes(help)
            .then(
                Node::argument("command", ArgKind::Greedy)
                    .describe("Show usage for one command")
                    .executes(help),
            ),
    );

    d.register(
        Node::literal("stats")
            .describe("Show cache counters and sizes")
            .executes(stats),
    );

    d.register(
        Node::literal("show").then(
            Node::argument("path", ArgKind::Word)
                .describe("Show the index entry for a path")
                .executes(show),
        ),
    );

    d.register(
        Node::literal("sources")
            .then(
                Node::literal("list")
                    .describe("List upstream sources in consultation order")
                    .executes(sources_list),
            )
            .then(
                Node::literal("add").requires(Privilege::Admin).then(
                    Node::argument("id", ArgKind::Word).then(
                        Node::argument("url", ArgKind::Word)
                            .describe("Add an upstream source")
                            .executes(sources_add)
                            .then(
                                Node::argument("priority", ArgKind::Integer)
                                    .executes(sources_add)
                                    .then(signed_node()),
                            )
                            .then(signed_node()),
                    ),
                ),
            )
            .then(
                Node::literal("remove").requires(Privilege::Admin).then(
                    Node::argument("id", ArgKind::Word)
                        .describe("Remove an upstream source")
                        .executes(sources_remove),
                ),
            ),
    );

    d.register(
        Node::literal("keys")
            .then(
                Node::literal("list")
                    .describe("List trusted key names")
                    .executes(keys_list),
            )
            .then(
                Node::literal("reload")
                    .requires(Privilege::Admin)
                    .describe("Reload trusted keys from configuration")
                    .executes(keys_reload),
            ),
    );

    d.register(
        Node::literal_with_aliases("user", &["u"])
            .then(
                Node::literal("list")
                    .describe("List users allowed to publish")
                    .executes(user_list),
            )
            .then(
                Node::literal("add").requires(Privilege::Admin).then(
                    Node::argument("name", ArgKind::Word)
                        .describe("Add a user with a generated password")
                        .executes(user_add)
                        .then(
                            Node::argument("password", ArgKind::Word)
                                .describe("Add a user or replace their password")
                                .executes(user_add),
                        ),
                ),
            )
            .then(
                Node::literal("remove").requires(Privilege::Admin).then(
                    Node::argument("name", ArgKind::Word)
                        .describe("Remove a user")
                        .executes(user_remove),
                ),
            ),
    );

    d.register(
        Node::literal("purge")
            .requires(Privilege::Admin)
            .then(
                Node::literal("*")
                    .describe("Drop every cached artifact")
                    .executes(purge_all)
                    .then(
                        Node::literal("keep-blobs")
                            .describe("Empty the index but leave blobs in the store")
                            .executes(purge_index),
                    ),
            )
            .then(
                Node::argument("path", ArgKind::Word)
                    .describe("Drop one cached artifact")
                    .executes(purge_path),
            ),
    );

    d.register(
        Node::literal("flush")
            .requires(Privilege::Admin)
            .describe("Write the cache index to disk now")
            .executes(flush),
    );

    d.register(
        Node::literal_with_aliases("exit", &["quit"])
            .describe("End this console session")
            .executes(|_, _| async { Ok(Reply::close("bye")) }),
    );

    d.register(
        Node::literal("shutdown")
            .requires(Privilege::Admin)
            .describe("Stop the server gracefully")
            .executes(shutdown),
    );

    d
}

fn signed_node() -> Node<CommandContext> {
    Node::literal("signed")
        .describe("Require signatures from trusted keys")
        .executes(sources_add_signed)
        .then(Node::argument("keys", ArgKind::Greedy).executes(sources_add_signed))
}

async fn help(ctx: CommandContext, args: Arguments) -> CommandResult {
    let usages = match args.text("command") {
        Some(command) => ctx
            .dispatcher
            .usages_for(command, ctx.privilege)
            .map_err(|e| CommandError(e.render()))?,
        None => ctx.dispatcher.usages(ctx.privilege),
    };

    let width = usages.iter().map(|u| u.syntax.len()).max().unwrap_or(0);
    let mut out = String::new();
    for usage in usages {
        let line = match usage.description {
            Some(desc) => format!("{:width$}  {desc}", usage.syntax),
            None => usage.syntax,
        };
        out.push_str(line.trim_end());
        out.push('\n');
    }
    Ok(Reply::text(out.trim_end()))
}

async fn stats(ctx: CommandContext, _: Arguments) -> CommandResult {
    let stats = ctx.engine.stats();
    let c = &stats.counters;
    let text = format!(
        "entries: {}\nin_flight: {}\nsources: {}\ntrusted_keys: {}\n\
         hits: {}\nmisses: {}\nupstream_fetches: {}\nfetch_failures: {}\n\
         verification_failures: {}\nsingleflight_joins: {}\npublishes: {}\npurges: {}",
        stats.entries,
        stats.in_flight,
        stats.sources,
        stats.trusted_keys,
        c.hits,
        c.misses,
        c.upstream_fetches,
        c.fetch_failures,
        c.verification_failures,
        c.singleflight_joins,
        c.publishes,
        c.purges,
    );
    Ok(Reply::text(text))
}

async fn show(ctx: CommandContext, args: Arguments) -> CommandResult {
    let path = args.text("path").unwrap_or_default();
    let entry = ctx
        .engine
        .show(path)
        .map_err(|e| CommandError(e.to_string()))?;
    let Some(entry) = entry else {
        return Ok(Reply::text(format!("{path}: not cached")));
    };

    let mut text = format!(
        "path: {}\nsize: {}\nsha256: {}\nsha1: {}\norigin: {}\nstate: {:?}\nfetched_at: {}",
        entry.path,
        entry.content_length,
        entry.checksums.sha256,
        entry.checksums.sha1,
        entry.origin,
        entry.state,
        entry.fetched_at,
    );
    if let Some(sig) = &entry.signature {
        text.push_str(&format!("\nsignature: {sig}"));
    }
    Ok(Reply::text(text))
}

async fn sources_list(ctx: CommandContext, _: Arguments) -> CommandResult {
    let sources = ctx.engine.state().sources();
    if sources.is_empty() {
        return Ok(Reply::text("no upstream sources"));
    }

    let mut text = String::new();
    for s in sources.iter() {
        let mut line = format!("{} {} priority={}", s.id, s.url, s.priority);
        if s.require_signature {
            line.push_str(" signed");
            if !s.allowed_keys.is_empty() {
                line.push_str(&format!(" keys={}", s.allowed_keys.join(",")));
            }
        }
        text.push_str(&line);
        text.push('\n');
    }
    Ok(Reply::text(text.trim_end()))
}

async fn sources_add(ctx: CommandContext, args: Arguments) -> CommandResult {
    add_source(ctx, args, false)
}

async fn sources_add_signed(ctx: CommandContext, args: Arguments) -> CommandResult {
    add_source(ctx, args, true)
}

fn add_source(ctx: CommandContext, args: Arguments, signed: bool) -> CommandResult {
    let id = args.text("id").unwrap_or_default();
    let url = args.text("url").unwrap_or_default();
    let mut source = UpstreamSource::new(id, url);

    if let Some(priority) = args.integer("priority") {
        source.priority = u32::try_from(priority)
            .map_err(|_| CommandError(format!("priority out of range: {priority}")))?;
    }
    source.require_signature = signed;
    if let Some(keys) = args.text("keys") {
        source.allowed_keys = keys.split_whitespace().map(str::to_string).collect();
    }

    ctx.engine
        .state()
        .add_source(source.clone())
        .map_err(|e| CommandError(e.to_string()))?;
    info!(
        source = %source.id,
        url = %source.url,
        priority = source.priority,
        require_signature = source.require_signature,
        "Added upstream source"
    );
    Ok(Reply::text(format!(
        "added {} (priority {})",
        source.id, source.priority
    )))
}

async fn sources_remove(ctx: CommandContext, args: Arguments) -> CommandResult {
    let id = args.text("id").unwrap_or_default();
    let removed = ctx
        .engine
        .state()
        .remove_source(id)
        .map_err(|e| CommandError(e.to_string()))?;
    info!(source = %removed.id, "Removed upstream source");
    Ok(Reply::text(format!("removed {}", removed.id)))
}

async fn keys_list(ctx: CommandContext, _: Arguments) -> CommandResult {
    let keys = ctx.engine.state().trusted_keys();
    if keys.is_empty() {
        return Ok(Reply::text("no trusted keys"));
    }
    let mut names: Vec<&str> = keys.names().collect();
    names.sort_unstable();
    Ok(Reply::text(names.join("\n")))
}

async fn keys_reload(ctx: CommandContext, _: Arguments) -> CommandResult {
    let count = ctx
        .engine
        .state()
        .reload_keys()
        .await
        .map_err(|e| CommandError(format!("key reload failed, keeping current keys: {e}")))?;
    info!(keys = count, "Reloaded trusted keys");
    Ok(Reply::text(format!("loaded {count} trusted keys")))
}

async fn user_list(ctx: CommandContext, _: Arguments) -> CommandResult {
    let names = ctx.engine.state().users().names();
    if names.is_empty() {
        return Ok(Reply::text("no users"));
    }
    Ok(Reply::text(names.join("\n")))
}

async fn user_add(ctx: CommandContext, args: Arguments) -> CommandResult {
    let name = args.text("name").unwrap_or_default();
    let (password, generated) = match args.text("password") {
        Some(password) => (password.to_string(), false),
        None => (generate_password(), true),
    };

    let replaced = ctx
        .engine
        .state()
        .users()
        .add(name, &password)
        .await
        .map_err(|e| CommandError(e.to_string()))?;
    info!(user = name, replaced, "Set upload credentials");

    let verb = if replaced { "updated" } else { "added" };
    if generated {
        Ok(Reply::text(format!("{verb} {name}\npassword: {password}")))
    } else {
        Ok(Reply::text(format!("{verb} {name}")))
    }
}

async fn user_remove(ctx: CommandContext, args: Arguments) -> CommandResult {
    let name = args.text("name").unwrap_or_default();
    let removed = ctx
        .engine
        .state()
        .users()
        .remove(name)
        .await
        .map_err(|e| CommandError(e.to_string()))?;
    if !removed {
        return Err(CommandError(format!("unknown user: {name}")));
    }
    info!(user = name, "Removed upload user");
    Ok(Reply::text(format!("removed {name}")))
}

/// 144 random bits, URL-safe base64.
fn generate_password() -> String {
    let mut bytes = [0u8; 18];
    rand_core::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

async fn purge_path(ctx: CommandContext, args: Arguments) -> CommandResult {
    let path = args.text("path").unwrap_or_default();
    let removed = ctx
        .engine
        .purge(path)
        .await
        .map_err(|e| CommandError(e.to_string()))?;
    if removed {
        Ok(Reply::text(format!("purged {path}")))
    } else {
        Ok(Reply::text(format!("{path}: not cached")))
    }
}

async fn purge_all(ctx: CommandContext, _: Arguments) -> CommandResult {
    let summary = ctx.engine.purge_all(true);
    Ok(Reply::text(format!(
        "purged {} entries; deleting blobs in the background",
        summary.entries
    )))
}

async fn purge_index(ctx: CommandContext, _: Arguments) -> CommandResult {
    let summary = ctx.engine.purge_all(false);
    Ok(Reply::text(format!(
        "purged {} entries (blobs kept)",
        summary.entries
    )))
}

async fn flush(ctx: CommandContext, _: Arguments) -> CommandResult {
    match ctx
        .engine
        .flush_index()
        .await
        .map_err(|e| CommandError(e.to_string()))?
    {
        Some(count) => Ok(Reply::text(format!("wrote {count} entries"))),
        None => Ok(Reply::text("no index file configured")),
    }
}

async fn shutdown(ctx: CommandContext, _: Arguments) -> CommandResult {
    info!("Shutdown requested from console");
    ctx.shutdown.trigger();
    Ok(Reply::close("shutting down"))
}
