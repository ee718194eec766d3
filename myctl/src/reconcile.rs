use std::sync::Arc;

use futures::stream::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Patch, PatchParams};
use kube::runtime::Controller;
use kube::runtime::controller::Action;
use kube::{Api, Client, ResourceExt};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use myops_types::{Mysql, MysqlStatus};
use owo_colors::OwoColorize;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::ctl::Myctl;
use crate::mutate;

/// Field manager for server-side apply.
pub const MANAGER_NAME: &str = "myctl";

/// Requeue interval when nothing interesting happened; the event queue is
/// the fast path.
const PROBE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("Invalid user input: {0}")]
    UserInput(String),

    #[error("Invalid spec: {source}")]
    Spec {
        #[from]
        source: myops_types::SpecError,
    },

    #[error("Json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

struct ContextData {
    client: Client,
    ctl: Myctl,
}

/// Entrypoint for the `Mysql` controller. Only the leader reconciles; the
/// coordinator's HTTP surface serves on every replica regardless.
pub async fn run(client: Client, ctl: Myctl, namespace: String) -> Result<(), Error> {
    println!("{}", "⚙️ Starting Mysql controller...".green());

    let context = Arc::new(ContextData {
        client: client.clone(),
        ctl: ctl.clone(),
    });

    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("myctl-{}", std::process::id()));
    let leadership = LeaseLock::new(
        client.clone(),
        &namespace,
        LeaseLockParams {
            holder_id,
            lease_name: "myctl-controller-lock".to_string(),
            lease_ttl: Duration::from_secs(15),
        },
    );

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        myops_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });

    // Standby replicas renew forever; the leader runs the controller and
    // drops it on leadership loss.
    let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(task) = controller_task.take() {
                    task.abort();
                    task.await.ok();
                }
                break Ok(());
            },
            _ = tick.tick() => {}
        }

        let lease = match leadership.try_acquire_or_renew().await {
            Ok(l) => l,
            Err(e) => {
                eprintln!("leader election renew/acquire failed: {e}");
                if let Some(task) = controller_task.take() {
                    task.abort();
                    eprintln!("aborted controller due to leader election error");
                }
                continue;
            }
        };

        if matches!(lease, LeaseLockResult::Acquired(_)) {
            if controller_task.is_none() {
                println!("{}", "👑 Acquired leadership; starting controller".green());
                let client = client.clone();
                let context = context.clone();
                let namespace = namespace.clone();
                let trigger = {
                    let events = ctl.events().clone();
                    futures::stream::unfold(events, |events| async move {
                        let _ = events.pop().await;
                        Some(((), events))
                    })
                };
                controller_task = Some(tokio::spawn(async move {
                    let crd_api: Api<Mysql> = Api::namespaced(client.clone(), &namespace);
                    Controller::new(crd_api, Default::default())
                        .owns(
                            Api::<StatefulSet>::namespaced(client.clone(), &namespace),
                            Default::default(),
                        )
                        .owns(
                            Api::<Service>::namespaced(client, &namespace),
                            Default::default(),
                        )
                        .reconcile_all_on(trigger)
                        .run(reconcile, on_error, context)
                        .for_each(|_res| async move {})
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            eprintln!("lost leadership; stopping controller");
            task.abort();
        }
    }
}

/// One reconcile pass: default + sync the group engine, write the normalized
/// spec and observed status back, then materialize the child objects.
async fn reconcile(instance: Arc<Mysql>, context: Arc<ContextData>) -> Result<Action, Error> {
    let namespace = instance.namespace().ok_or_else(|| {
        Error::UserInput("expected Mysql resource to be namespaced".to_string())
    })?;
    let name = instance.name_any();

    #[cfg(feature = "metrics")]
    context
        .ctl
        .metrics()
        .reconciles
        .with_label_values(&[&namespace, &name])
        .inc();

    if instance.metadata.deletion_timestamp.is_some() {
        context.ctl.purge(&(namespace, name)).await;
        return Ok(Action::await_change());
    }

    let mut mysql = (*instance).clone();
    mysql.default_fill()?;
    context.ctl.sync_spec(&mut mysql).await?;

    let api: Api<Mysql> = Api::namespaced(context.client.clone(), &namespace);
    api.patch(
        &name,
        &PatchParams::apply(MANAGER_NAME),
        &Patch::Merge(&serde_json::json!({ "spec": &mysql.spec })),
    )
    .await?;
    patch_status(&api, &name, &instance, mysql.status.clone().unwrap_or_default()).await?;

    let svc_api: Api<Service> = Api::namespaced(context.client.clone(), &namespace);
    for svc in mutate::services(&mysql) {
        apply(&svc_api, &svc).await?;
    }

    let sts_api: Api<StatefulSet> = Api::namespaced(context.client.clone(), &namespace);
    apply(&sts_api, &mutate::statefulset(&mysql)).await?;

    Ok(Action::requeue(PROBE_INTERVAL))
}

async fn apply<K>(api: &Api<K>, obj: &K) -> Result<(), kube::Error>
where
    K: kube::Resource + Clone + serde::Serialize + serde::de::DeserializeOwned + std::fmt::Debug,
{
    let name = obj.meta().name.clone().unwrap_or_default();
    api.patch(
        &name,
        &PatchParams::apply(MANAGER_NAME).force(),
        &Patch::Apply(obj),
    )
    .await?;
    Ok(())
}

/// Status is patched as a JSON diff against the observed object, so fields
/// owned by others survive.
async fn patch_status(
    api: &Api<Mysql>,
    name: &str,
    before: &Mysql,
    status: MysqlStatus,
) -> Result<(), Error> {
    let mut modified = before.clone();
    modified.status = Some(status);
    let patch = json_patch::diff(
        &serde_json::to_value(before)?,
        &serde_json::to_value(&modified)?,
    );
    api.patch_status(
        name,
        &PatchParams::apply(MANAGER_NAME),
        &Patch::Json::<Mysql>(patch),
    )
    .await?;
    Ok(())
}

fn on_error(instance: Arc<Mysql>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!(
            "Reconciliation error: {:?} {}/{}",
            error,
            instance.namespace().unwrap_or_default(),
            instance.name_any()
        )
        .red()
    );
    Action::requeue(Duration::from_secs(5))
}
