//! The chat hub: presence notices, room messaging and a countdown stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hubwire_server::{
    Hub, HubCallContext, HubError, InvocationContext, MethodTable, Result, StreamSource,
};
use serde_json::{Value, json};
use tracing::{debug, info};

hubwire_server::hub_client! {
    /// Methods chat clients implement.
    pub struct ChatClient {
        /// A connection joined.
        fn user_joined(connection_id: &str) => "UserJoined";
        /// A connection left.
        fn user_left(connection_id: &str) => "UserLeft";
        /// A chat line, from `sender`.
        fn send(sender: &str, message: &str) => "Send";
    }
}

/// Largest countdown a client may request.
const MAX_COUNTDOWN: u32 = 1000;

/// Shared chat state.
#[derive(Default)]
pub struct Chat {
    online: AtomicUsize,
}

impl Chat {
    /// Connections currently online.
    pub fn online(&self) -> usize {
        self.online.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Hub for Chat {
    async fn on_connected(&self, ctx: &HubCallContext) -> Result<()> {
        let online = self.online.fetch_add(1, Ordering::SeqCst) + 1;
        let id = ctx.caller.connection_id().to_string();
        info!(conn_id = %id, online, "chat user joined");
        ChatClient::new(ctx.clients.others()).user_joined(&id).await
    }

    async fn on_disconnected(&self, ctx: &HubCallContext, error: Option<&HubError>) -> Result<()> {
        let online = self.online.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        let id = ctx.caller.connection_id().to_string();
        info!(conn_id = %id, online, error = error.map(|e| e.code()).unwrap_or("-"), "chat user left");
        ChatClient::new(ctx.clients.others()).user_left(&id).await
    }
}

/// Register the chat methods.
pub fn methods() -> Result<MethodTable<Chat>> {
    MethodTable::builder()
        .method("Send", send)
        .method("SendToGroup", send_to_group)
        .method("JoinGroup", join_group)
        .method("LeaveGroup", leave_group)
        .method("Online", |hub: Arc<Chat>, _| async move { Ok(json!(hub.online())) })
        .stream("Countdown", countdown)
        .build()
}

async fn send(_hub: Arc<Chat>, ctx: InvocationContext) -> Result<Value> {
    let message: String = ctx.arg(0)?;
    let sender = sender_name(&ctx);
    ChatClient::new(ctx.clients().all()).send(&sender, &message).await?;
    Ok(Value::Null)
}

async fn send_to_group(_hub: Arc<Chat>, ctx: InvocationContext) -> Result<Value> {
    let group: String = ctx.arg(0)?;
    let message: String = ctx.arg(1)?;
    let sender = sender_name(&ctx);
    ChatClient::new(ctx.clients().group(group)).send(&sender, &message).await?;
    Ok(Value::Null)
}

async fn join_group(_hub: Arc<Chat>, ctx: InvocationContext) -> Result<Value> {
    let group: String = ctx.arg(0)?;
    let id = ctx.caller().connection_id().to_string();
    ctx.groups().add_to_group(&id, &group).await?;
    ChatClient::new(ctx.clients().group(group.clone()))
        .send(&id, &format!("{id} joined {group}"))
        .await?;
    Ok(Value::Null)
}

async fn leave_group(_hub: Arc<Chat>, ctx: InvocationContext) -> Result<Value> {
    let group: String = ctx.arg(0)?;
    let id = ctx.caller().connection_id().to_string();
    ctx.groups().remove_from_group(&id, &group).await?;
    ChatClient::new(ctx.clients().group(group.clone()))
        .send(&id, &format!("{id} left {group}"))
        .await?;
    Ok(Value::Null)
}

/// Counts down from `start` to 1, one item per `delay_ms`.
async fn countdown(_hub: Arc<Chat>, ctx: InvocationContext) -> Result<StreamSource> {
    let start: u32 = ctx.arg(0)?;
    let delay_ms: u64 = ctx.arg(1)?;
    if start > MAX_COUNTDOWN {
        return Err(HubError::Hub(format!("Countdown is limited to {MAX_COUNTDOWN}.")));
    }
    let delay = Duration::from_millis(delay_ms);
    Ok(StreamSource::push(move |sink, cancel| async move {
        for n in (1..=start).rev() {
            sink.send(json!(n)).await?;
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!(remaining = n - 1, "countdown canceled");
                    return Ok(());
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
        Ok(())
    }))
}

fn sender_name(ctx: &InvocationContext) -> String {
    let caller = ctx.caller();
    caller
        .user_identifier()
        .map_or_else(|| caller.connection_id().to_string(), str::to_owned)
}
