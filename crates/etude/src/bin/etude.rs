use etude::{
    ClientPool, MemoryCredentialStore, PooledCredentialStore, Server, ServerConfig, init_logging,
};
use std::sync::Arc;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::from_env()?;
    init_logging(&config.log);

    let users = MemoryCredentialStore::new();
    let store = PooledCredentialStore::new(ClientPool::connect(config.credential_pool_size, || {
        Ok(users.client())
    })?);

    let server = Server::new(config, Arc::new(store))?;
    let handle = server.shutdown_handle();
    ctrlc::set_handler(move || {
        tracing::info!("received SIGINT, shutting down");
        handle.shutdown();
    })?;

    server.run()?;
    Ok(())
}
