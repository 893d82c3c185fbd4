use anyhow::{Context, Result, bail};
use deadpool_postgres::{Config as PgConfig, ManagerConfig, Pool, RecyclingMethod};
use rustls::pki_types::CertificateDer;
use tokio_postgres::NoTls;

use crate::args::PostgresArgs;

pub async fn create_pool(pg_args: PostgresArgs) -> Result<Pool> {
    let mut cfg = PgConfig::new();
    cfg.host = Some(pg_args.postgres_host);
    cfg.port = Some(pg_args.postgres_port);
    cfg.dbname = Some(pg_args.postgres_database);
    cfg.user = Some(pg_args.postgres_username);
    cfg.password = pg_args
        .postgres_password
        .or_else(|| std::env::var("POSTGRES_PASSWORD").ok());
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });

    if let Some(ref ca_cert) = pg_args.postgres_ca_cert {
        let extra_roots =
            parse_ca_certs(ca_cert.as_bytes()).context("failed to parse CA certificate")?;
        let tls = crate::make_rustls(extra_roots).context("failed to build TLS connector")?;
        cfg.create_pool(Some(deadpool_postgres::Runtime::Tokio1), tls)
            .context("failed to create postgres pool")
    } else {
        cfg.create_pool(Some(deadpool_postgres::Runtime::Tokio1), NoTls)
            .context("failed to create postgres pool")
    }
}

fn parse_ca_certs(bytes: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    // PEM bundles carry one or more certs; anything else is treated as raw DER
    if !bytes.starts_with(b"-----BEGIN") {
        return Ok(vec![CertificateDer::from(bytes.to_vec())]);
    }
    let mut rd: &[u8] = bytes;
    let mut out = Vec::new();
    for item in rustls_pemfile::read_all(&mut rd) {
        let item = item.context("failed to parse PEM bundle")?;
        if let rustls_pemfile::Item::X509Certificate(der) = item {
            out.push(der);
        }
    }
    if out.is_empty() {
        bail!("no X509 certificates found in provided PEM");
    }
    Ok(out)
}
