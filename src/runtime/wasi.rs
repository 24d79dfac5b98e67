//! Minimal `wasi_snapshot_preview1` shim.
//!
//! Components built for WASI expect a handful of functions even when they
//! never touch the filesystem. Only those are provided; there is no
//! filesystem, network or environment access.

use crate::runtime::host::{Ctx, HostFunctionProvider, HostLinkerBuilder, LinkerError};
use crate::runtime::HostContext;
use rand::RngCore;
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};
use wasmtime::Caller;

pub const WASI_MODULE: &str = "wasi_snapshot_preview1";

/// Every WASI function the shim provides.
pub const WASI_FUNCTIONS: [&str; 9] = [
    "fd_write",
    "random_get",
    "clock_time_get",
    "environ_sizes_get",
    "environ_get",
    "args_sizes_get",
    "args_get",
    "proc_exit",
    "sched_yield",
];

const ERRNO_SUCCESS: i32 = 0;
const ERRNO_BADF: i32 = 8;
const ERRNO_FAULT: i32 = 21;
const ERRNO_INVAL: i32 = 28;

const CLOCK_REALTIME: i32 = 0;
const CLOCK_MONOTONIC: i32 = 1;

/// Upper bound on iovecs in one `fd_write`.
const MAX_IOVS: i32 = 1024;

fn errno(result: Result<i32, LinkerError>) -> i32 {
    result.unwrap_or(ERRNO_FAULT)
}

fn fd_write(
    ctx: &mut Ctx<'_, HostContext>,
    fd: i32,
    iovs: i32,
    iovs_len: i32,
    nwritten: i32,
) -> Result<i32, LinkerError> {
    if fd != 1 && fd != 2 {
        return Ok(ERRNO_BADF);
    }
    if !(0..=MAX_IOVS).contains(&iovs_len) {
        return Ok(ERRNO_INVAL);
    }

    let mut data = Vec::new();
    for i in 0..iovs_len {
        let base = iovs.wrapping_add(i * 8);
        let ptr = ctx.read_u32(base)?;
        let len = ctx.read_u32(base.wrapping_add(4))?;
        data.extend(ctx.read_bytes(ptr as i32, len as i32)?);
    }
    ctx.write_u32(nwritten, data.len() as u32)?;

    let text = String::from_utf8_lossy(&data);
    let text = text.trim_end();
    if !text.is_empty() {
        let service = ctx.data().service().to_string();
        if fd == 1 {
            info!(service = %service, "{}", text);
        } else {
            warn!(service = %service, "{}", text);
        }
    }
    Ok(ERRNO_SUCCESS)
}

fn clock_now(id: i32) -> Option<u64> {
    static START: OnceLock<Instant> = OnceLock::new();
    match id {
        CLOCK_REALTIME => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|d| d.as_nanos() as u64),
        CLOCK_MONOTONIC => Some(START.get_or_init(Instant::now).elapsed().as_nanos() as u64),
        _ => None,
    }
}

fn write_zero_pair(ctx: &mut Ctx<'_, HostContext>, a: i32, b: i32) -> Result<i32, LinkerError> {
    ctx.write_u32(a, 0)?;
    ctx.write_u32(b, 0)?;
    Ok(ERRNO_SUCCESS)
}

/// Provider registering the shim.
pub struct WasiShim;

impl HostFunctionProvider<HostContext> for WasiShim {
    fn register(&self, builder: &mut HostLinkerBuilder<'_, HostContext>) -> Result<(), LinkerError> {
        builder
            .interface(WASI_MODULE)?
            .func_raw(
                "fd_write",
                |caller: Caller<'_, HostContext>, fd: i32, iovs: i32, iovs_len: i32, nwritten: i32| -> i32 {
                    let mut ctx = Ctx::new(caller);
                    errno(fd_write(&mut ctx, fd, iovs, iovs_len, nwritten))
                },
            )?
            .func_raw(
                "random_get",
                |caller: Caller<'_, HostContext>, buf: i32, len: i32| -> i32 {
                    let mut bytes = vec![0u8; len as u32 as usize];
                    rand::thread_rng().fill_bytes(&mut bytes);
                    let mut ctx = Ctx::new(caller);
                    errno(ctx.write_bytes(buf, &bytes).map(|_| ERRNO_SUCCESS))
                },
            )?
            .func_raw(
                "clock_time_get",
                |caller: Caller<'_, HostContext>, id: i32, _precision: i64, out: i32| -> i32 {
                    let Some(now) = clock_now(id) else {
                        return ERRNO_INVAL;
                    };
                    let mut ctx = Ctx::new(caller);
                    errno(ctx.write_u64(out, now).map(|_| ERRNO_SUCCESS))
                },
            )?
            .func_raw(
                "environ_sizes_get",
                |caller: Caller<'_, HostContext>, count: i32, size: i32| -> i32 {
                    errno(write_zero_pair(&mut Ctx::new(caller), count, size))
                },
            )?
            .func_raw(
                "environ_get",
                |_caller: Caller<'_, HostContext>, _environ: i32, _buf: i32| -> i32 { ERRNO_SUCCESS },
            )?
            .func_raw(
                "args_sizes_get",
                |caller: Caller<'_, HostContext>, count: i32, size: i32| -> i32 {
                    errno(write_zero_pair(&mut Ctx::new(caller), count, size))
                },
            )?
            .func_raw(
                "args_get",
                |_caller: Caller<'_, HostContext>, _argv: i32, _buf: i32| -> i32 { ERRNO_SUCCESS },
            )?
            .func_raw(
                "proc_exit",
                |caller: Caller<'_, HostContext>, code: i32| -> wasmtime::Result<()> {
                    Err(anyhow::anyhow!(
                        "{} called proc_exit({})",
                        caller.data().service(),
                        code
                    ))
                },
            )?
            .func_raw("sched_yield", |_caller: Caller<'_, HostContext>| -> i32 {
                ERRNO_SUCCESS
            })?;
        Ok(())
    }
}
