use std::{collections::BTreeMap, future::Future, path::Path, time::Duration};

use async_trait::async_trait;
use etcd_client::{
    Certificate, Client, Compare, CompareOp, ConnectOptions, GetOptions, Identity, KvClient,
    TlsOptions, Txn, TxnOp,
};
use log::debug;

use super::{KvStore, StoreError, StoreOptions};

/// etcd v3 backed store. Every request is bounded by the configured timeout
/// and never retried.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    timeout: Duration,
}

impl EtcdStore {
    pub async fn connect(options: &StoreOptions) -> Result<Self, StoreError> {
        let mut connect_options = ConnectOptions::new()
            .with_connect_timeout(options.timeout)
            .with_timeout(options.timeout);

        if options.is_secure() {
            connect_options = connect_options.with_tls(load_tls_options(options).await?);
        }

        debug!("Connecting to the store at '{}'...", options.endpoint);

        let connection = Client::connect([options.endpoint.as_str()], Some(connect_options));
        let client = tokio::time::timeout(options.timeout, connection)
            .await
            .map_err(|_| StoreError::Timeout("connect", options.timeout))?
            .map_err(|source| StoreError::Connect {
                endpoint: options.endpoint.to_owned(),
                source,
            })?;

        Ok(Self {
            client,
            timeout: options.timeout,
        })
    }

    fn kv(&self) -> KvClient {
        self.client.kv_client()
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        request: impl Future<Output = Result<T, etcd_client::Error>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| StoreError::Timeout(operation, self.timeout))?
            .map_err(StoreError::Request)
    }
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut kv = self.kv();
        let response = self.bounded("get", kv.get(key, None)).await?;

        match response.kvs().first() {
            Some(entry) => Ok(Some(
                entry.value_str().map_err(StoreError::Request)?.to_owned(),
            )),
            None => Ok(None),
        }
    }

    async fn get_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>, StoreError> {
        let mut kv = self.kv();
        let response = self
            .bounded(
                "prefix scan",
                kv.get(prefix, Some(GetOptions::new().with_prefix())),
            )
            .await?;

        response
            .kvs()
            .iter()
            .map(|entry| {
                Ok((
                    entry.key_str().map_err(StoreError::Request)?.to_owned(),
                    entry.value_str().map_err(StoreError::Request)?.to_owned(),
                ))
            })
            .collect()
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut kv = self.kv();
        self.bounded("put", kv.put(key, value, None)).await?;

        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        // create_revision is 0 only for keys that don't exist
        let txn = Txn::new()
            .when([Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then([TxnOp::put(key, value, None)]);

        let mut kv = self.kv();
        let response = self.bounded("conditional put", kv.txn(txn)).await?;

        Ok(response.succeeded())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut kv = self.kv();
        self.bounded("delete", kv.delete(key, None)).await?;

        Ok(())
    }
}

async fn load_tls_options(options: &StoreOptions) -> Result<TlsOptions, StoreError> {
    let (cert_file, key_file) = match (&options.cert_file, &options.key_file) {
        (Some(cert_file), Some(key_file)) => (cert_file, key_file),
        _ => return Err(StoreError::MissingClientIdentity(options.endpoint.to_owned())),
    };

    let identity = Identity::from_pem(read_pem(cert_file).await?, read_pem(key_file).await?);
    let mut tls = TlsOptions::new().identity(identity);

    if let Some(ca_file) = &options.trusted_ca_file {
        tls = tls.ca_certificate(Certificate::from_pem(read_pem(ca_file).await?));
    }

    Ok(tls)
}

async fn read_pem(path: &Path) -> Result<Vec<u8>, StoreError> {
    tokio::fs::read(path)
        .await
        .map_err(|source| StoreError::TlsMaterial {
            path: path.to_owned(),
            source,
        })
}
