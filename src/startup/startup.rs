use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::errors::AppError;
use crate::infrastructure::relay::{BundlerClient, RelayClient};
use crate::repositories::StoreRegistry;
use crate::services::Reconciler;
use crate::{log_info, log_warn};

/// 应用程序启动与管理结构体（仅后台对账服务，无HTTP API）
pub struct Application {
    pub registry: Arc<StoreRegistry>,
    pub reconciler: Arc<Reconciler>,
    cancel: CancellationToken,
}

pub type Result<T> = std::result::Result<T, AppError>;

impl Application {
    /// 连接数据库、加载已登记合约、初始化中继客户端（不启动循环）
    pub async fn build(config: Config) -> Result<Self> {
        let chain_id = config.chain.chain_id;

        let registry = Arc::new(StoreRegistry::open(chain_id, &config.database).await?);
        log_info!("Store registry initialized: chain={}", chain_id);

        let relay = Arc::new(BundlerClient::new(&config.relay)?) as Arc<dyn RelayClient>;
        log_info!("Relay client ready: {}", config.relay.rpc_url);

        let cancel = CancellationToken::new();
        let reconciler = Arc::new(Reconciler::new(
            config.reconciler,
            registry.clone(),
            relay,
            cancel.clone(),
        ));

        Ok(Self {
            registry,
            reconciler,
            cancel,
        })
    }

    /// 运行对账循环直到 Ctrl-C 或致命错误；退出前总会关闭注册表
    pub async fn run(self) -> anyhow::Result<()> {
        let reconciler = self.reconciler.clone();
        let mut task = tokio::spawn(async move { reconciler.background().await });

        let outcome = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log_info!("收到退出信号，停止对账服务...");
                self.cancel.cancel();
                task.await
            }
            res = &mut task => res,
        };

        let result = match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::error!("对账服务异常退出: {:?}", e);
                Err(AppError::from(e).into())
            }
            Err(e) => {
                tracing::error!("对账任务崩溃: {:?}", e);
                Err(AppError::from(e).into())
            }
        };

        if let Err(e) = self.registry.close().await {
            log_warn!("关闭存储失败: {}", e);
        }
        result
    }
}
