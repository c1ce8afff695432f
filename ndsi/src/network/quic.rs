// QUIC连接器：每个会话一条连接，控制与数据各占一条双向流

use super::connector::Connector;
use crate::config::TransportConfig;
use crate::error::{ConnectionError, Result};
use crate::sensor::SessionChannels;
use async_trait::async_trait;
use common::{encode_message, ChannelKind, ClientMessage, SensorIdentity};
use futures::SinkExt;
use quinn::{ClientConfig, Endpoint};
use std::sync::Arc;
use tokio_util::codec::{FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info};

pub struct QuicConnector {
    endpoint: Endpoint,
    server_name: String,
}

impl QuicConnector {
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let bind = "0.0.0.0:0"
            .parse()
            .map_err(|e| ConnectionError::Transport(format!("invalid bind address: {}", e)))?;
        let mut endpoint = Endpoint::client(bind).map_err(|e| ConnectionError::Transport(e.to_string()))?;

        // 设备使用自签名证书，跳过证书验证
        let crypto = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth();

        let mut client_config = ClientConfig::new(Arc::new(crypto));
        let mut transport_config = quinn::TransportConfig::default();
        let idle_timeout = config
            .idle_timeout
            .try_into()
            .map_err(|e| ConnectionError::Transport(format!("invalid idle timeout: {}", e)))?;
        transport_config.max_idle_timeout(Some(idle_timeout));
        transport_config.keep_alive_interval(Some(config.keep_alive_interval));
        client_config.transport_config(Arc::new(transport_config));

        endpoint.set_default_client_config(client_config);

        Ok(Self {
            endpoint,
            server_name: config.server_name.clone(),
        })
    }
}

#[async_trait]
impl Connector for QuicConnector {
    async fn connect(&self, identity: &SensorIdentity) -> Result<SessionChannels> {
        let connection = self
            .endpoint
            .connect(identity.address, &self.server_name)
            .map_err(|e| ConnectionError::Transport(e.to_string()))?
            .await
            .map_err(|e| ConnectionError::Refused(e.to_string()))?;
        info!("Connected to sensor host at {}", connection.remote_address());

        let (control_tx, control_rx) = connection
            .open_bi()
            .await
            .map_err(|e| ConnectionError::Lost(e.to_string()))?;
        let (data_tx, data_rx) = connection
            .open_bi()
            .await
            .map_err(|e| ConnectionError::Lost(e.to_string()))?;

        // 设备按首条Hello区分数据流与控制流
        let hello = encode_message(&ClientMessage::Hello {
            sensor_id: identity.sensor_id.clone(),
            channel: ChannelKind::Data,
        })?;
        let mut framed = FramedWrite::new(data_tx, LengthDelimitedCodec::new());
        framed
            .send(hello)
            .await
            .map_err(|e| ConnectionError::Lost(e.to_string()))?;
        let data_tx = framed.into_inner();
        debug!("Data stream opened for {}", identity.sensor_id);

        let closer = move || {
            drop(data_tx);
            connection.close(0u32.into(), b"session closed");
        };
        Ok(SessionChannels::new(control_rx, control_tx, data_rx).with_closer(closer))
    }
}

struct SkipServerVerification;

impl rustls::client::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}
