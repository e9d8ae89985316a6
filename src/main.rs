// #![deny(warnings)]

use std::sync::Arc;

use tokio::sync::mpsc::{channel, Sender};
use tor_router::{arg, Helper, InstancePool, ProxyResult, TorRouter};

#[cfg(unix)]
async fn wait_signal(pool: Arc<InstancePool>, sender: Sender<()>) {
    use tokio::signal::unix::{signal, SignalKind};
    let (mut term, mut hup) = match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
        (Ok(term), Ok(hup)) => (term, hup),
        _ => {
            log::warn!("无法监听系统信号, 仅处理ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
            let _ = sender.send(()).await;
            return;
        }
    };
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = term.recv() => break,
            _ = hup.recv() => {
                log::info!("收到SIGHUP, 所有实例更换身份");
                if let Err(e) = pool.new_identites().await {
                    log::warn!("更换身份失败: {}", e);
                }
            }
        }
    }
    let _ = sender.send(()).await;
}

#[cfg(not(unix))]
async fn wait_signal(_pool: Arc<InstancePool>, sender: Sender<()>) {
    let _ = tokio::signal::ctrl_c().await;
    let _ = sender.send(()).await;
}

async fn run_main() -> ProxyResult<()> {
    let option = arg::parse_env()?;
    Helper::try_init_log(&option)?;
    let mut router = TorRouter::new(option);
    router.ready_serve().await?;
    let (sender_close, receiver_close) = channel::<()>(1);
    tokio::spawn(wait_signal(router.pool().clone(), sender_close));
    router.run_serve(receiver_close).await
}

#[tokio::main]
async fn main() {
    if let Err(e) = run_main().await {
        eprintln!("启动失败: {}", e);
        std::process::exit(1);
    }
}
