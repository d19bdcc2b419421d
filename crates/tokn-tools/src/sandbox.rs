//! QuickJS execution of user tool code.
//!
//! Runs synchronously on the calling thread; the bridge gives each
//! invocation its own worker thread and interrupt flag. The context has no
//! module loader and no file or process access. The only host functions are
//! a blocking `fetch` and a `console` that forwards to `tracing`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rquickjs::{Context, Function, Runtime};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use tokn_core::types::ToolPayload;

/// Resource limits for one script run.
#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    pub memory_limit_bytes: usize,
    pub fetch_timeout: Duration,
    /// When the caller stops waiting. A `fetch` never outlives it.
    pub deadline: Instant,
}

/// Upper bound on jobs run while unwinding an interrupted script.
const MAX_DRAIN_JOBS: usize = 10_000;

#[derive(Debug, Clone, PartialEq)]
pub enum SandboxError {
    /// The interrupt flag was raised (timeout or cancellation).
    Interrupted,
    /// The script threw, or its promise rejected.
    Script(String),
    /// The runtime could not be set up.
    Setup(String),
}

/// Host-side glue installed before user code runs.
const PRELUDE: &str = r#"
(function () {
  const fmt = (v) => {
    if (typeof v === "string") return v;
    try { return JSON.stringify(v); } catch (_) { return String(v); }
  };
  const log = (level) => (...items) => __host_log(level, items.map(fmt).join(" "));
  globalThis.console = {
    log: log("info"), info: log("info"), debug: log("debug"),
    warn: log("warn"), error: log("error"),
  };

  class Headers {
    constructor(map) { this._map = {}; for (const k in (map || {})) this._map[k.toLowerCase()] = String(map[k]); }
    get(name) { const v = this._map[String(name).toLowerCase()]; return v === undefined ? null : v; }
    has(name) { return String(name).toLowerCase() in this._map; }
  }

  class Response {
    constructor(raw) {
      this.status = raw.status;
      this.statusText = raw.statusText || "";
      this.ok = raw.status >= 200 && raw.status < 300;
      this.url = raw.url;
      this.headers = new Headers(raw.headers);
      this._body = raw.body;
    }
    text() { return Promise.resolve(this._body); }
    json() {
      try { return Promise.resolve(JSON.parse(this._body)); }
      catch (e) { return Promise.reject(e); }
    }
  }

  globalThis.fetch = function (input, init) {
    init = init || {};
    return new Promise(function (resolve, reject) {
      const request = {
        url: String(input),
        method: init.method ? String(init.method).toUpperCase() : "GET",
        headers: init.headers || {},
        body: init.body == null ? null : String(init.body),
      };
      const raw = JSON.parse(__host_fetch(JSON.stringify(request)));
      if (raw.error) reject(new TypeError(raw.error));
      else resolve(new Response(raw));
    });
  };

  globalThis.__settle_ok = function (v) {
    if (typeof v === "string") {
      globalThis.__tool_outcome = JSON.stringify({ kind: "text", value: v });
    } else if (v instanceof ArrayBuffer || ArrayBuffer.isView(v)) {
      const view = v instanceof ArrayBuffer
        ? new Uint8Array(v)
        : new Uint8Array(v.buffer, v.byteOffset, v.byteLength);
      globalThis.__tool_outcome = JSON.stringify({ kind: "bytes", value: Array.from(view) });
    } else {
      try {
        globalThis.__tool_outcome = JSON.stringify({ kind: "json", value: v === undefined ? null : v });
      } catch (e) {
        globalThis.__settle_err(e);
      }
    }
  };

  globalThis.__settle_err = function (e) {
    globalThis.__tool_failure = (e instanceof Error) ? (e.name + ": " + e.message) : String(e);
  };
})();
"#;

/// Compiles the body as an async function of `args` and starts it.
const DRIVER: &str = r#"
(function () {
  const AsyncFunction = (async function () {}).constructor;
  let run;
  try { run = new AsyncFunction("args", __tool_code); }
  catch (e) { __settle_err(e); return; }
  let pending;
  try { pending = run(JSON.parse(__tool_args)); }
  catch (e) { __settle_err(e); return; }
  pending.then(__settle_ok, __settle_err);
})();
"#;

#[derive(Deserialize)]
struct Outcome {
    kind: String,
    #[serde(default)]
    value: Value,
}

#[derive(Deserialize)]
struct FetchRequest {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: serde_json::Map<String, Value>,
    #[serde(default)]
    body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Run `code` with `args` bound, until its promise settles or `interrupt` is raised.
pub fn run_script(
    code: &str,
    args: &Value,
    limits: SandboxLimits,
    interrupt: Arc<AtomicBool>,
) -> Result<ToolPayload, SandboxError> {
    let setup = |e: rquickjs::Error| SandboxError::Setup(e.to_string());

    let runtime = Runtime::new().map_err(setup)?;
    runtime.set_memory_limit(limits.memory_limit_bytes);
    let flag = interrupt.clone();
    runtime.set_interrupt_handler(Some(Box::new(move || flag.load(Ordering::Relaxed))));
    let ctx = Context::full(&runtime).map_err(setup)?;

    let fetch_timeout = limits.fetch_timeout;
    let deadline = limits.deadline;
    let fetch_flag = interrupt.clone();
    let started = ctx.with(|ctx| -> rquickjs::Result<()> {
        let globals = ctx.globals();
        globals.set(
            "__host_fetch",
            Function::new(ctx.clone(), move |request: String| {
                if fetch_flag.load(Ordering::Relaxed) {
                    return json!({ "error": "tool call interrupted" }).to_string();
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return json!({ "error": "tool deadline reached" }).to_string();
                }
                host_fetch(&request, fetch_timeout.min(remaining))
            })?,
        )?;
        globals.set(
            "__host_log",
            Function::new(ctx.clone(), |level: String, message: String| {
                match level.as_str() {
                    "warn" | "error" => warn!(target: "tokn::tool", "{}", message),
                    "debug" => debug!(target: "tokn::tool", "{}", message),
                    _ => info!(target: "tokn::tool", "{}", message),
                }
            })?,
        )?;
        ctx.eval::<(), _>(PRELUDE)?;
        globals.set("__tool_code", code.to_string())?;
        globals.set("__tool_args", args.to_string())?;
        ctx.eval::<(), _>(DRIVER)
    });

    if let Err(e) = started {
        if interrupt.load(Ordering::Relaxed) {
            return Err(SandboxError::Interrupted);
        }
        return Err(SandboxError::Script(e.to_string()));
    }

    // Drive pending promise jobs until the tool settles.
    while runtime.is_job_pending() {
        if interrupt.load(Ordering::Relaxed) {
            break;
        }
        if !run_job(&runtime, &ctx) {
            if interrupt.load(Ordering::Relaxed) {
                break;
            }
            debug!("Pending job raised an exception");
        }
    }
    if interrupt.load(Ordering::Relaxed) {
        drain_jobs(&runtime, &ctx);
        return Err(SandboxError::Interrupted);
    }

    let (outcome, failure) = ctx.with(|ctx| {
        let globals = ctx.globals();
        let outcome: Option<String> = globals.get("__tool_outcome").ok().flatten();
        let failure: Option<String> = globals.get("__tool_failure").ok().flatten();
        (outcome, failure)
    });

    if let Some(message) = failure {
        return Err(SandboxError::Script(message));
    }
    let Some(raw) = outcome else {
        return Err(SandboxError::Script(
            "tool returned a promise that never settled".to_string(),
        ));
    };
    let outcome: Outcome =
        serde_json::from_str(&raw).map_err(|e| SandboxError::Script(e.to_string()))?;

    Ok(match outcome.kind.as_str() {
        "text" => ToolPayload::Text(outcome.value.as_str().unwrap_or_default().to_string()),
        "bytes" => ToolPayload::Bytes(
            outcome
                .value
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_u64)
                        .map(|b| b as u8)
                        .collect()
                })
                .unwrap_or_default(),
        ),
        _ => ToolPayload::Json(outcome.value),
    })
}

/// Run one queued job. Returns false when it raised.
fn run_job(runtime: &Runtime, ctx: &Context) -> bool {
    match runtime.execute_pending_job() {
        Ok(_) => true,
        Err(exception) => {
            // QuickJS hands back the job's context without taking a reference,
            // while the handle frees one on drop. Take it first to keep the
            // count balanced.
            // SAFETY: the pointer is the live context owned by `ctx`.
            unsafe {
                rquickjs::qjs::JS_DupContext(exception.0.as_raw().as_ptr());
            }
            drop(exception);
            ctx.with(|ctx| {
                let _ = ctx.catch();
            });
            false
        }
    }
}

/// Unwind an interrupted script. The flag stays raised, so each queued job
/// fails on entry and its exception is cleared before the runtime is dropped.
fn drain_jobs(runtime: &Runtime, ctx: &Context) {
    let mut drained = 0;
    while runtime.is_job_pending() && drained < MAX_DRAIN_JOBS {
        run_job(runtime, ctx);
        drained += 1;
    }
    ctx.with(|ctx| {
        let _ = ctx.catch();
    });
    debug!(drained, "Interrupted tool unwound");
}

/// Perform a `fetch` for tool code. Always returns a JSON string; transport
/// failures come back as `{"error": ...}` so the script sees a rejection.
fn host_fetch(request: &str, timeout: Duration) -> String {
    let request: FetchRequest = match serde_json::from_str(request) {
        Ok(r) => r,
        Err(e) => return json!({ "error": format!("invalid fetch request: {}", e) }).to_string(),
    };
    if !(request.url.starts_with("http://") || request.url.starts_with("https://")) {
        return json!({ "error": format!("unsupported URL scheme: {}", request.url) }).to_string();
    }

    let client = match reqwest::blocking::Client::builder().timeout(timeout).build() {
        Ok(c) => c,
        Err(e) => return json!({ "error": e.to_string() }).to_string(),
    };
    let method = match reqwest::Method::from_bytes(request.method.as_bytes()) {
        Ok(m) => m,
        Err(_) => return json!({ "error": format!("invalid method: {}", request.method) }).to_string(),
    };

    let mut req = client.request(method, &request.url);
    for (k, v) in &request.headers {
        let value = v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string());
        req = req.header(k.as_str(), value);
    }
    if let Some(body) = request.body {
        req = req.body(body);
    }

    debug!(url = %request.url, "Tool fetch");
    match req.send() {
        Ok(resp) => {
            let status = resp.status();
            let url = resp.url().to_string();
            let headers: serde_json::Map<String, Value> = resp
                .headers()
                .iter()
                .filter_map(|(k, v)| {
                    v.to_str()
                        .ok()
                        .map(|v| (k.as_str().to_string(), Value::String(v.to_string())))
                })
                .collect();
            let body = resp.text().unwrap_or_default();
            json!({
                "status": status.as_u16(),
                "statusText": status.canonical_reason().unwrap_or(""),
                "url": url,
                "headers": headers,
                "body": body,
            })
            .to_string()
        }
        Err(e) => json!({ "error": e.to_string() }).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> SandboxLimits {
        SandboxLimits {
            memory_limit_bytes: 32 * 1024 * 1024,
            fetch_timeout: Duration::from_secs(1),
            deadline: Instant::now() + Duration::from_secs(30),
        }
    }

    fn run(code: &str, args: Value) -> Result<ToolPayload, SandboxError> {
        run_script(code, &args, limits(), Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn test_result_kinds() {
        assert_eq!(
            run("return `hi ${args.name}`;", json!({"name": "bob"})),
            Ok(ToolPayload::Text("hi bob".into()))
        );
        assert_eq!(
            run("return { sum: args.a + args.b };", json!({"a": 1, "b": 2})),
            Ok(ToolPayload::Json(json!({"sum": 3})))
        );
        assert_eq!(
            run("return new Uint8Array([1, 2, 255]);", json!({})),
            Ok(ToolPayload::Bytes(vec![1, 2, 255]))
        );
        assert_eq!(run("", json!({})), Ok(ToolPayload::Json(Value::Null)));
    }

    #[test]
    fn test_await_inside_body() {
        let code = "const v = await Promise.resolve(41); return v + 1;";
        assert_eq!(run(code, json!({})), Ok(ToolPayload::Json(json!(42))));
    }

    #[test]
    fn test_thrown_error_and_syntax_error() {
        match run("throw new Error('boom');", json!({})) {
            Err(SandboxError::Script(m)) => assert!(m.contains("boom")),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(matches!(run("return (;", json!({})), Err(SandboxError::Script(_))));
    }

    #[test]
    fn test_no_host_modules() {
        let code = "return [typeof require, typeof std, typeof os, typeof fetch];";
        assert_eq!(
            run(code, json!({})),
            Ok(ToolPayload::Json(json!(["undefined", "undefined", "undefined", "function"])))
        );
    }

    #[test]
    fn test_fetch_rejects_non_http() {
        let code = "try { await fetch('file:///etc/passwd'); return 'read'; } catch (e) { return e.message; }";
        match run(code, json!({})) {
            Ok(ToolPayload::Text(m)) => assert!(m.contains("unsupported URL scheme")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_raised_flag_interrupts_loop() {
        let flag = Arc::new(AtomicBool::new(true));
        let result = run_script("while (true) {}", &json!({}), limits(), flag);
        assert_eq!(result, Err(SandboxError::Interrupted));
    }

    #[test]
    fn test_interrupt_after_await_unwinds_cleanly() {
        let flag = Arc::new(AtomicBool::new(false));
        let raiser = flag.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            raiser.store(true, Ordering::Relaxed);
        });
        let code = "await Promise.resolve(1); while (true) {}";
        let result = run_script(code, &json!({}), limits(), flag);
        handle.join().unwrap();
        assert_eq!(result, Err(SandboxError::Interrupted));

        // The next runtime on this thread must still work.
        assert_eq!(run("return 1 + 1;", json!({})), Ok(ToolPayload::Json(json!(2))));
    }

    #[test]
    fn test_fetch_after_deadline_is_rejected() {
        let mut expired = limits();
        expired.deadline = Instant::now();
        let code = "try { await fetch('http://127.0.0.1:9/'); return 'sent'; } catch (e) { return e.message; }";
        let result = run_script(code, &json!({}), expired, Arc::new(AtomicBool::new(false)));
        match result {
            Ok(ToolPayload::Text(m)) => assert!(m.contains("deadline")),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
