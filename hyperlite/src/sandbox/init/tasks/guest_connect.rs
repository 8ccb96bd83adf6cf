//! Tasks: connect the host ends of the guest channels.
//!
//! All three run in parallel once the hypervisor is up. Init and TTY are
//! required; the console is best effort.

use super::{InitCtx, log_task_error, task_start};
use crate::pipeline::PipelineTask;
use crate::portal::{InitChannel, InitChannelConfig, TtyMux, await_ready, spawn_console_logger};
use crate::util::connect_unix;
use async_trait::async_trait;
use hyperlite_shared::{HyperliteError, HyperliteResult};

pub struct InitConnectTask;

#[async_trait]
impl PipelineTask<InitCtx> for InitConnectTask {
    async fn run(self: Box<Self>, ctx: InitCtx) -> HyperliteResult<()> {
        let task_name = self.name();
        let sandbox_id = task_start(&ctx, task_name).await;

        let (socket, timeouts, finish_policy, events, reattach) = {
            let ctx = ctx.lock().await;
            (
                ctx.layout.init_socket(),
                ctx.timeouts,
                ctx.finish_policy,
                ctx.events.clone(),
                ctx.is_reattach(),
            )
        };

        let channel = async {
            let mut stream = connect_unix(&socket, timeouts.guest_connect).await?;
            // A running guest announced readiness to the previous control plane.
            if !reattach {
                await_ready(&mut stream, timeouts.guest_connect).await?;
            }
            Ok::<_, HyperliteError>(InitChannel::spawn(
                sandbox_id.clone(),
                stream,
                InitChannelConfig {
                    ping_interval: timeouts.ping_interval,
                    pong_timeout: timeouts.pong_timeout,
                    finish_policy,
                },
                events,
            ))
        }
        .await
        .inspect_err(|e| log_task_error(&sandbox_id, task_name, e))?;

        tracing::info!(sandbox_id = %sandbox_id, reattach, "Init channel connected");
        ctx.lock().await.links.init = Some(channel);
        Ok(())
    }

    fn name(&self) -> &str {
        "init_connect"
    }
}

pub struct TtyConnectTask;

#[async_trait]
impl PipelineTask<InitCtx> for TtyConnectTask {
    async fn run(self: Box<Self>, ctx: InitCtx) -> HyperliteResult<()> {
        let task_name = self.name();
        let sandbox_id = task_start(&ctx, task_name).await;

        let (socket, timeout, reports, events) = {
            let ctx = ctx.lock().await;
            (
                ctx.layout.tty_socket(),
                ctx.timeouts.guest_connect,
                ctx.reports.clone(),
                ctx.events.clone(),
            )
        };

        let stream = connect_unix(&socket, timeout)
            .await
            .inspect_err(|e| log_task_error(&sandbox_id, task_name, e))?;
        let mux = TtyMux::spawn(sandbox_id.clone(), stream, reports, events);

        ctx.lock().await.links.tty = Some(mux);
        Ok(())
    }

    fn name(&self) -> &str {
        "tty_connect"
    }
}

pub struct ConsoleTask;

#[async_trait]
impl PipelineTask<InitCtx> for ConsoleTask {
    async fn run(self: Box<Self>, ctx: InitCtx) -> HyperliteResult<()> {
        let task_name = self.name();
        let sandbox_id = task_start(&ctx, task_name).await;

        let (socket, timeout) = {
            let ctx = ctx.lock().await;
            (ctx.layout.console_socket(), ctx.timeouts.guest_connect)
        };

        match connect_unix(&socket, timeout).await {
            Ok(stream) => {
                let logger = spawn_console_logger(sandbox_id, stream);
                ctx.lock().await.links.console = Some(logger);
            }
            Err(e) => {
                tracing::warn!(sandbox_id = %sandbox_id, error = %e, "Console unavailable");
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "console_connect"
    }
}
