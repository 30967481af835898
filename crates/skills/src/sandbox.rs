//! Per-invocation WASM sandbox
//!
//! Each invocation gets a fresh engine, store and instance; no state survives
//! between invocations. The guest sees the locked-down WASI preview1 layer
//! (environment variables only, no preopened directories, no network) plus
//! exactly two imported host functions under the `env` module:
//!
//! - `host_log(ptr, len)` records the UTF-8 message as a `skill.log` audit
//!   event and into the process log.
//! - `host_publish(subject_ptr, subject_len, payload_ptr, payload_len)`
//!   returns 0 on success, 1 on permission denial, 2 on runtime failure.
//!   The permission check runs before any side effect.
//!
//! The invocation deadline is enforced with epoch interruption: a watchdog
//! bumps the engine epoch once the deadline passes and the guest traps at the
//! next safepoint.

use std::path::Path;
use std::time::Duration;

use wasmtime::{Caller, Config, Engine, Linker, Module, Store, Trap};
use wasmtime_wasi::preview1::WasiP1Ctx;
use wasmtime_wasi::WasiCtxBuilder;

use crate::SkillError;

pub const PUBLISH_OK: u32 = 0;
pub const PUBLISH_ERR_NOT_ALLOWED: u32 = 1;
pub const PUBLISH_ERR_RUNTIME: u32 = 2;

/// Audit record emitted from inside a host call.
#[derive(Debug, Clone)]
pub struct HostAuditEvent {
    pub event_type: &'static str,
    pub data: serde_json::Value,
}

/// Callbacks wired into the two host functions. `allow_publish` must be
/// checked before `publish` ever runs.
pub struct HostBindings {
    pub skill: String,
    pub allow_publish: Box<dyn Fn(&str) -> Result<(), String> + Send + Sync>,
    pub publish: Box<dyn Fn(&str, &[u8]) -> Result<(), String> + Send + Sync>,
    pub record_audit: Box<dyn Fn(HostAuditEvent) + Send + Sync>,
}

struct StoreState {
    wasi: WasiP1Ctx,
    host: HostBindings,
}

/// Load the module at `module_path` and run `entrypoint` with the given
/// guest environment. Blocking; callers run it on a blocking worker thread.
pub fn invoke(
    module_path: &Path,
    entrypoint: &str,
    env: &[(String, String)],
    host: HostBindings,
    deadline: Duration,
) -> Result<(), SkillError> {
    let mut config = Config::new();
    config.epoch_interruption(true);
    let engine = Engine::new(&config).map_err(|e| SkillError::Sandbox(format!("engine: {e}")))?;

    let module = Module::from_file(&engine, module_path)
        .map_err(|e| SkillError::Sandbox(format!("load module: {e}")))?;

    let mut linker: Linker<StoreState> = Linker::new(&engine);
    wasmtime_wasi::preview1::add_to_linker_sync(&mut linker, |state: &mut StoreState| {
        &mut state.wasi
    })
    .map_err(|e| SkillError::Sandbox(format!("wasi: {e}")))?;
    add_host_functions(&mut linker)?;

    let mut wasi = WasiCtxBuilder::new();
    for (key, value) in env {
        wasi.env(key, value);
    }
    let state = StoreState {
        wasi: wasi.build_p1(),
        host,
    };

    let mut store = Store::new(&engine, state);
    store.set_epoch_deadline(1);

    // Watchdog: bump the epoch once the deadline passes; dropping the sender
    // on return wakes it early.
    let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
    let watchdog_engine = engine.clone();
    let watchdog = std::thread::spawn(move || {
        if done_rx.recv_timeout(deadline).is_err() {
            watchdog_engine.increment_epoch();
        }
    });

    let outcome = (|| {
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| SkillError::Sandbox(format!("instantiate: {e}")))?;
        let entry = instance
            .get_typed_func::<(), ()>(&mut store, entrypoint)
            .map_err(|_| SkillError::Sandbox(format!("entrypoint {entrypoint:?} not found")))?;
        entry.call(&mut store, ()).map_err(|e| {
            if matches!(e.downcast_ref::<Trap>(), Some(Trap::Interrupt)) {
                SkillError::Timeout(deadline.as_secs())
            } else {
                SkillError::Sandbox(format!("entrypoint failed: {e}"))
            }
        })
    })();

    drop(done_tx);
    let _ = watchdog.join();
    outcome
}

fn add_host_functions(linker: &mut Linker<StoreState>) -> Result<(), SkillError> {
    linker
        .func_wrap(
            "env",
            "host_log",
            |mut caller: Caller<'_, StoreState>, ptr: u32, len: u32| {
                if len == 0 {
                    return;
                }
                let Some(bytes) = read_guest_memory(&mut caller, ptr, len) else {
                    tracing::warn!(ptr, len, "host_log: unreadable guest memory");
                    return;
                };
                let message = String::from_utf8_lossy(&bytes).into_owned();
                let host = &caller.data().host;
                tracing::info!(skill = %host.skill, message = %message, "skill log");
                (host.record_audit)(HostAuditEvent {
                    event_type: "skill.log",
                    data: serde_json::json!({ "message": message }),
                });
            },
        )
        .map_err(|e| SkillError::Sandbox(format!("export host_log: {e}")))?;

    linker
        .func_wrap(
            "env",
            "host_publish",
            |mut caller: Caller<'_, StoreState>,
             subject_ptr: u32,
             subject_len: u32,
             payload_ptr: u32,
             payload_len: u32|
             -> u32 {
                let Some(subject_bytes) = read_guest_memory(&mut caller, subject_ptr, subject_len)
                else {
                    return PUBLISH_ERR_RUNTIME;
                };
                let Ok(subject) = String::from_utf8(subject_bytes) else {
                    return PUBLISH_ERR_RUNTIME;
                };

                // Permission gate runs before the payload is even read.
                if let Err(reason) = (caller.data().host.allow_publish)(&subject) {
                    let skill = caller.data().host.skill.clone();
                    tracing::warn!(skill, subject, reason, "skill publish blocked");
                    return PUBLISH_ERR_NOT_ALLOWED;
                }

                let payload = if payload_len > 0 {
                    match read_guest_memory(&mut caller, payload_ptr, payload_len) {
                        Some(bytes) => bytes,
                        None => return PUBLISH_ERR_RUNTIME,
                    }
                } else {
                    Vec::new()
                };

                let host = &caller.data().host;
                if let Err(error) = (host.publish)(&subject, &payload) {
                    tracing::error!(skill = %host.skill, subject, error, "skill publish failed");
                    return PUBLISH_ERR_RUNTIME;
                }
                (host.record_audit)(HostAuditEvent {
                    event_type: "skill.publish",
                    data: serde_json::json!({
                        "subject": subject,
                        "payload_bytes": payload_len,
                    }),
                });
                PUBLISH_OK
            },
        )
        .map_err(|e| SkillError::Sandbox(format!("export host_publish: {e}")))?;

    Ok(())
}

fn read_guest_memory(
    caller: &mut Caller<'_, StoreState>,
    ptr: u32,
    len: u32,
) -> Option<Vec<u8>> {
    let memory = caller.get_export("memory")?.into_memory()?;
    let start = ptr as usize;
    let end = start.checked_add(len as usize)?;
    memory.data(caller).get(start..end).map(<[u8]>::to_vec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io::Write;
    use std::sync::Arc;

    struct Recorded {
        published: Mutex<Vec<(String, Vec<u8>)>>,
        audited: Mutex<Vec<HostAuditEvent>>,
    }

    fn bindings(allowed: &'static str, recorded: Arc<Recorded>) -> HostBindings {
        let publish_sink = Arc::clone(&recorded);
        let audit_sink = Arc::clone(&recorded);
        HostBindings {
            skill: "test-skill".to_string(),
            allow_publish: Box::new(move |subject| {
                if subject == allowed {
                    Ok(())
                } else {
                    Err(format!("subject {subject} not declared"))
                }
            }),
            publish: Box::new(move |subject, payload| {
                publish_sink
                    .published
                    .lock()
                    .push((subject.to_string(), payload.to_vec()));
                Ok(())
            }),
            record_audit: Box::new(move |event| {
                audit_sink.audited.lock().push(event);
            }),
        }
    }

    fn wat_module(wat: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".wat").tempfile().unwrap();
        file.write_all(wat.as_bytes()).unwrap();
        file
    }

    const PUBLISH_ALLOWED: &str = r#"
(module
  (import "env" "host_publish" (func $publish (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "allowed.subjecthi")
  (func (export "run")
    (drop (call $publish (i32.const 16) (i32.const 15) (i32.const 31) (i32.const 2)))))
"#;

    const PUBLISH_OTHER: &str = r#"
(module
  (import "env" "host_publish" (func $publish (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "other.subject")
  (func (export "run")
    (drop (call $publish (i32.const 16) (i32.const 13) (i32.const 0) (i32.const 0)))))
"#;

    const LOG_ONLY: &str = r#"
(module
  (import "env" "host_log" (func $log (param i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 8) "hello from guest")
  (func (export "run")
    (call $log (i32.const 8) (i32.const 16))))
"#;

    const SPIN: &str = r#"
(module
  (func (export "run")
    (loop $spin (br $spin))))
"#;

    #[test]
    fn test_allowed_publish_reaches_bus_and_audit() {
        let recorded = Arc::new(Recorded {
            published: Mutex::new(Vec::new()),
            audited: Mutex::new(Vec::new()),
        });
        let module = wat_module(PUBLISH_ALLOWED);

        invoke(
            module.path(),
            "run",
            &[],
            bindings("allowed.subject", recorded.clone()),
            Duration::from_secs(5),
        )
        .unwrap();

        let published = recorded.published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "allowed.subject");
        assert_eq!(published[0].1, b"hi");

        let audited = recorded.audited.lock();
        assert!(audited.iter().any(|e| e.event_type == "skill.publish"));
    }

    #[test]
    fn test_undeclared_subject_denied_without_side_effect() {
        let recorded = Arc::new(Recorded {
            published: Mutex::new(Vec::new()),
            audited: Mutex::new(Vec::new()),
        });
        let module = wat_module(PUBLISH_OTHER);

        invoke(
            module.path(),
            "run",
            &[],
            bindings("allowed.subject", recorded.clone()),
            Duration::from_secs(5),
        )
        .unwrap();

        assert!(recorded.published.lock().is_empty());
        assert!(recorded
            .audited
            .lock()
            .iter()
            .all(|e| e.event_type != "skill.publish"));
    }

    #[test]
    fn test_host_log_records_audit_event() {
        let recorded = Arc::new(Recorded {
            published: Mutex::new(Vec::new()),
            audited: Mutex::new(Vec::new()),
        });
        let module = wat_module(LOG_ONLY);

        invoke(
            module.path(),
            "run",
            &[],
            bindings("allowed.subject", recorded.clone()),
            Duration::from_secs(5),
        )
        .unwrap();

        let audited = recorded.audited.lock();
        assert_eq!(audited.len(), 1);
        assert_eq!(audited[0].event_type, "skill.log");
        assert_eq!(audited[0].data["message"], "hello from guest");
    }

    #[test]
    fn test_runaway_guest_interrupted_at_deadline() {
        let recorded = Arc::new(Recorded {
            published: Mutex::new(Vec::new()),
            audited: Mutex::new(Vec::new()),
        });
        let module = wat_module(SPIN);

        let result = invoke(
            module.path(),
            "run",
            &[],
            bindings("allowed.subject", recorded),
            Duration::from_millis(200),
        );
        assert!(matches!(result, Err(SkillError::Timeout(_))));
    }

    #[test]
    fn test_missing_entrypoint_fails() {
        let recorded = Arc::new(Recorded {
            published: Mutex::new(Vec::new()),
            audited: Mutex::new(Vec::new()),
        });
        let module = wat_module(LOG_ONLY);

        let result = invoke(
            module.path(),
            "not_exported",
            &[],
            bindings("allowed.subject", recorded),
            Duration::from_secs(5),
        );
        assert!(matches!(result, Err(SkillError::Sandbox(_))));
    }
}
