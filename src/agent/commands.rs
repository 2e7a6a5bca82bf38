//! Commands answered inside the target process.

use std::sync::Arc;

use anyhow::Result;
use jni::JNIEnv;

use super::{AgentSession, HookKind};
use crate::error::ArtscopeError;
use crate::refs::{current_env, JniBridge, ScriptValue};
use crate::registry::{CommandLine, CommandRegistry, CommandResult};
use crate::symbols::{find_library, list_sections};

pub fn register_builtins(registry: &mut CommandRegistry<AgentSession>) {
    registry.register("ping", "Test connection", ping);
    registry.register("help", "List available commands", help);
    registry.register("sec", "List ELF sections of a mapped library", sec);
    registry.register("hooktype", "Show or set the default hook type", hooktype);
    registry.register("jni", "JNI string helpers", jni);
}

fn written(result: std::io::Result<()>) -> CommandResult {
    match result {
        Ok(()) => CommandResult::ok(""),
        Err(err) => CommandResult::fail(format!("write to client failed: {err}")),
    }
}

fn ping(session: &mut AgentSession, _line: &CommandLine<'_>) -> CommandResult {
    written(session.write("pong\n"))
}

fn help(session: &mut AgentSession, _line: &CommandLine<'_>) -> CommandResult {
    let agent = Arc::clone(session.agent());
    written(agent.registry().list(session.client()))
}

fn sec(session: &mut AgentSession, line: &CommandLine<'_>) -> CommandResult {
    let library = line.args.trim();
    if library.is_empty() {
        return CommandResult::fail("Usage: sec <library>\n");
    }
    match section_report(library) {
        Ok(report) => written(session.write(&report)),
        Err(err) => CommandResult::fail(format!("ERROR: {err:#}\n")),
    }
}

fn section_report(library: &str) -> Result<String> {
    let mapped = find_library(None, library)?
        .ok_or_else(|| ArtscopeError::LibraryNotMapped(library.to_string()))?;
    let sections = list_sections(&mapped.path)?;

    let mut report = format!(
        "Sections of {} (base 0x{:x}, {}):\n",
        mapped.path.display(),
        mapped.start,
        sections.len()
    );
    for (i, section) in sections.iter().enumerate() {
        report.push_str(&format!(
            "  [{:2}] {:<24} addr=0x{:08x} offset=0x{:08x} size=0x{:x}\n",
            i, section.name, section.addr, section.offset, section.size
        ));
    }
    Ok(report)
}

fn hooktype(session: &mut AgentSession, line: &CommandLine<'_>) -> CommandResult {
    let agent = Arc::clone(session.agent());
    let requested = line.args.trim();
    if requested.is_empty() {
        return written(session.write(&format!("Hook type: {}\n", agent.hook_kind())));
    }
    match requested.parse::<HookKind>() {
        Ok(kind) => {
            agent.set_hook_kind(kind);
            written(session.write(&format!("Hook type set to {kind}\n")))
        }
        Err(err) => CommandResult::fail(format!("ERROR: {err}\n")),
    }
}

const JNI_USAGE: &str = "Usage: jni <newstring TEXT|getstring REF|strlen REF|delglobal REF>\n";

#[derive(Debug, PartialEq, Eq)]
enum JniOp<'a> {
    NewString(&'a str),
    GetString(i64),
    StringLength(i64),
    DeleteGlobal(i64),
}

fn parse_jni(args: &str) -> Option<JniOp<'_>> {
    let (op, rest) = args.split_once(' ').unwrap_or((args, ""));
    let rest = rest.trim();
    match op {
        "newstring" => Some(JniOp::NewString(rest)),
        "getstring" => parse_ref(rest).map(JniOp::GetString),
        "strlen" => parse_ref(rest).map(JniOp::StringLength),
        "delglobal" => parse_ref(rest).map(JniOp::DeleteGlobal),
        _ => None,
    }
}

/// Reference values are printed in hex, so accept both `0x..` and decimal.
fn parse_ref(text: &str) -> Option<i64> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok().map(|v| v as i64),
        None => text.parse().ok(),
    }
}

fn run_jni(bridge: &JniBridge<'_>, env: &mut JNIEnv<'_>, op: JniOp<'_>) -> Result<ScriptValue> {
    match op {
        JniOp::NewString(text) => bridge.new_string_utf(env, text),
        JniOp::GetString(reference) => bridge.get_string_utf(env, reference),
        JniOp::StringLength(reference) => bridge.get_string_length(env, reference),
        JniOp::DeleteGlobal(reference) => bridge.delete_global_ref(env, reference),
    }
}

fn jni(session: &mut AgentSession, line: &CommandLine<'_>) -> CommandResult {
    let Some(op) = parse_jni(line.args.trim()) else {
        return CommandResult::fail(JNI_USAGE);
    };
    let agent = Arc::clone(session.agent());
    let value = current_env(agent.vm()).and_then(|mut env| {
        let bridge = JniBridge::new(agent.decoder());
        run_jni(&bridge, &mut env, op)
    });
    match value {
        Ok(value) => written(session.write(&format!("{value}\n"))),
        Err(err) => CommandResult::fail(format!("ERROR: {err:#}\n")),
    }
}
