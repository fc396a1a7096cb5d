use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use scamp_bus::discovery::{generate_identity, Announcement, DescriptorBuilder, Source};
use scamp_bus::server::{accept_tcp, bind, json_reply};
use scamp_bus::{
    action_fn, AccessPolicy, ActionDescriptor, ActionFlags, ActionName, ActionTable,
    DiscoveryConfig, DiscoveryRegistry, ErrorCode, Principal, Request, RequestOptions, Requester,
    RequesterConfig, RpcError, Server, ServerConfig, ServerIncoming, ServiceIdentity,
    StaticPrivileges, TcpConnector, TicketVerifier,
};
use serde_json::json;
use tokio::sync::broadcast;

struct Tickets;

#[async_trait]
impl TicketVerifier for Tickets {
    async fn verify(&self, ticket: &str) -> Option<Principal> {
        (ticket == "staff").then(|| Principal {
            user_id: 42,
            client_id: 1,
            validity_start: 0,
            validity_length: 1 << 40,
            privileges: BTreeSet::from(["greet".to_string()]),
        })
    }
}

fn greeter_table() -> ActionTable {
    ActionTable::new()
        .register(
            ActionDescriptor::new(ActionName::from_qualified("main", "Greeter.hello", 1))
                .flags(ActionFlags::READ | ActionFlags::NOAUTH),
            action_fn(|request: Request| async move {
                let value = request.json(4096).await?;
                let name = value["name"].as_str().unwrap_or("stranger").to_string();
                Ok::<_, RpcError>(json_reply(&json!({ "greeting": format!("hello {name}") })))
            }),
        )
        .register(
            ActionDescriptor::new(ActionName::from_qualified("main", "Greeter.whoami", 2)),
            action_fn(|request: Request| async move {
                let user = request.principal.map(|p| p.user_id);
                Ok::<_, RpcError>(json_reply(&json!({ "user": user })))
            }),
        )
}

struct Running {
    uri: String,
    shutdown: broadcast::Sender<()>,
    server: Server,
}

async fn start_greeter() -> anyhow::Result<Running> {
    let config = ServerConfig::default().bind_addr(Ipv4Addr::LOCALHOST);
    let policy = AccessPolicy::new(Tickets, StaticPrivileges::new().require("greeter.whoami", ["greet"]));
    let server = Server::with_policy(greeter_table(), policy, config.clone());

    let (listener, uri) = bind(&config).await?;
    let (incoming, sender) = ServerIncoming::new();
    let (shutdown, shutdown_rx) = broadcast::channel(1);
    accept_tcp(listener, sender, shutdown_rx);
    let serving = server.clone();
    tokio::spawn(async move { serving.serve(incoming).await });
    Ok(Running {
        uri,
        shutdown,
        server,
    })
}

fn announce(registry: &DiscoveryRegistry, actions: Vec<ActionDescriptor>, uri: &str) -> anyhow::Result<()> {
    let builder = DescriptorBuilder::new(
        ServiceIdentity::generate()?,
        Announcement {
            identity: generate_identity("greeter"),
            sector: "main".to_string(),
            weight: 1.0,
            send_interval: Duration::from_secs(5),
            envelopes: vec!["json".to_string()],
            actions,
        },
    );
    builder.add_address("lo", uri);
    let blob = builder.blob_for("lo", false)?;
    assert_eq!(registry.ingest(&blob, Source::Broadcast), scamp_bus::discovery::Admission::Admitted);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_request_over_tcp() -> anyhow::Result<()> {
    let running = start_greeter().await?;
    let registry = DiscoveryRegistry::new(DiscoveryConfig::default(), scamp_bus::discovery::AllowAll);
    announce(&registry, running.server.actions(), &running.uri)?;
    let requester = Requester::new(registry, TcpConnector, RequesterConfig::default());

    let opts = RequestOptions::default();
    let reply = requester.request_json("greeter.hello", &json!({"name": "bus"}), &opts).await?;
    assert_eq!(reply, json!({"greeting": "hello bus"}));

    // CRUD alias resolves to the concrete action
    let reply = requester.request_json("greeter._read", &json!({}), &opts).await?;
    assert_eq!(reply, json!({"greeting": "hello stranger"}));

    let err = requester
        .request_json("greeter.missing", &json!({}), &opts)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::NoSuchAction);

    running.shutdown.send(())?;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_tickets_checked_by_server() -> anyhow::Result<()> {
    let running = start_greeter().await?;
    let registry = DiscoveryRegistry::new(DiscoveryConfig::default(), scamp_bus::discovery::AllowAll);
    announce(&registry, running.server.actions(), &running.uri)?;
    let requester = Requester::new(registry, TcpConnector, RequesterConfig::default());

    let anonymous = RequestOptions::default().version(2);
    let err = requester
        .request_json("greeter.whoami", &json!({}), &anonymous)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Authn);
    assert_eq!(err.message, "Need valid ticket for Greeter.whoami");

    let staff = RequestOptions::default().version(2).ticket("staff");
    let reply = requester.request_json("greeter.whoami", &json!({}), &staff).await?;
    assert_eq!(reply, json!({"user": 42}));

    running.shutdown.send(())?;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_dead_endpoint_is_routed_around() -> anyhow::Result<()> {
    let running = start_greeter().await?;
    let dead = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        format!("scamp+tls://{}", listener.local_addr()?)
    };

    let registry = DiscoveryRegistry::new(DiscoveryConfig::default(), scamp_bus::discovery::AllowAll);
    announce(&registry, running.server.actions(), &running.uri)?;
    announce(&registry, running.server.actions(), &dead)?;
    let requester = Requester::new(registry.clone(), TcpConnector, RequesterConfig::default());

    for _ in 0..6 {
        let reply = requester
            .request_json("greeter.hello", &json!({"name": "again"}), &RequestOptions::default())
            .await?;
        assert_eq!(reply["greeting"], "hello again");
    }
    let failed = registry
        .snapshot()
        .into_iter()
        .filter(|d| registry.is_failed(d))
        .count();
    assert!(failed <= 1);

    running.shutdown.send(())?;
    Ok(())
}
