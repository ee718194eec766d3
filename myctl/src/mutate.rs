use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction, ObjectFieldSelector,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe,
    SecurityContext, Service, ServicePort, ServiceSpec, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Resource;
use myops_types::{HEADLESS_SUFFIX, Mysql, group_token};

const POD_NAME_LABEL: &str = "statefulset.kubernetes.io/pod-name";
const MYDIR_VOLUME: &str = "mydir";

fn owner_refs(mysql: &Mysql) -> Option<Vec<OwnerReference>> {
    mysql.controller_owner_ref(&()).map(|r| vec![r])
}

fn meta(mysql: &Mysql, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: mysql.metadata.namespace.clone(),
        labels: Some(mysql.new_labels()),
        owner_references: owner_refs(mysql),
        ..Default::default()
    }
}

fn service_ports(mysql: &Mysql) -> Vec<ServicePort> {
    vec![
        ServicePort {
            name: Some("mysql".to_string()),
            port: mysql.spec.port as i32,
            target_port: Some(IntOrString::Int(mysql.spec.port as i32)),
            ..Default::default()
        },
        ServicePort {
            name: Some("mylet".to_string()),
            port: mysql.spec.mylet_port as i32,
            target_port: Some(IntOrString::Int(mysql.spec.mylet_port as i32)),
            ..Default::default()
        },
    ]
}

/// The three cluster services: the headless service backing stable pod DNS,
/// and the write/read services whose selectors pin a single pod by name.
/// SwitchPrimary events rewrite the write selector on the next reconcile.
pub fn services(mysql: &Mysql) -> Vec<Service> {
    let labels = mysql.new_labels();
    let write_id = mysql
        .status
        .as_ref()
        .and_then(|s| s.write_id)
        .unwrap_or(0);
    let read_id = mysql
        .status
        .as_ref()
        .and_then(|s| s.read_id)
        .unwrap_or(0);

    let headless = Service {
        metadata: meta(mysql, mysql.build_name(HEADLESS_SUFFIX)),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: Some(labels.clone()),
            ports: Some(service_ports(mysql)),
            ..Default::default()
        }),
        ..Default::default()
    };

    let pinned = |suffix: &str, id: i32| {
        let mut selector = labels.clone();
        selector.insert(POD_NAME_LABEL.to_string(), mysql.solo_name(id));
        Service {
            metadata: meta(mysql, mysql.build_name(suffix)),
            spec: Some(ServiceSpec {
                selector: Some(selector),
                ports: Some(service_ports(mysql)),
                ..Default::default()
            }),
            ..Default::default()
        }
    };

    vec![headless, pinned("write", write_id), pinned("read", read_id)]
}

/// One StatefulSet runs the whole group; each pod is a solo with its mylet
/// supervisor as the main container.
pub fn statefulset(mysql: &Mysql) -> StatefulSet {
    let labels = mysql.new_labels();

    let mut pod_labels = mysql.spec.labels.clone();
    pod_labels.extend(labels.clone());
    let annotations = mysql.spec.annotations.clone();

    let init = Container {
        name: "init".to_string(),
        image: Some(mysql.spec.image.clone()),
        image_pull_policy: Some(mysql.spec.image_pull_policy.clone()),
        command: Some(vec![
            "bash".to_string(),
            "-c".to_string(),
            format!(
                "mkdir -p {dir}/my.cnf.d && chown mysql:mysql {dir} {dir}/my.cnf.d",
                dir = mysql.spec.mydir
            ),
        ]),
        security_context: Some(SecurityContext {
            run_as_user: Some(0),
            ..Default::default()
        }),
        volume_mounts: Some(vec![mydir_mount(mysql)]),
        ..Default::default()
    };

    let mut containers = vec![mylet_container(mysql)];
    if mysql.spec.enable_exporter {
        containers.push(exporter_container(mysql));
    }

    StatefulSet {
        metadata: meta(mysql, mysql.group_name().to_string()),
        spec: Some(StatefulSetSpec {
            service_name: Some(mysql.build_name(HEADLESS_SUFFIX)),
            replicas: Some(mysql.spec.size()),
            selector: LabelSelector {
                match_labels: Some(labels),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: if annotations.is_empty() {
                        None
                    } else {
                        Some(annotations)
                    },
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    init_containers: Some(vec![init]),
                    containers,
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(vec![PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(MYDIR_VOLUME.to_string()),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                    storage_class_name: Some(mysql.spec.storage_class_name.clone()),
                    resources: Some(VolumeResourceRequirements {
                        requests: Some(BTreeMap::from([(
                            "storage".to_string(),
                            Quantity(mysql.spec.storage_size.clone()),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mydir_mount(mysql: &Mysql) -> VolumeMount {
    VolumeMount {
        name: MYDIR_VOLUME.to_string(),
        mount_path: mysql.spec.mydir.clone(),
        ..Default::default()
    }
}

fn mylet_probe(mysql: &Mysql, which: &str) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(format!("/api/addons/mylet/probe/{which}")),
            port: IntOrString::Int(mysql.spec.mylet_port as i32),
            ..Default::default()
        }),
        period_seconds: Some(5),
        // The agent may restore a peer backup before mysqld answers; give
        // startup the full hour the post-start check allows.
        failure_threshold: Some(if which == "startup" { 720 } else { 3 }),
        ..Default::default()
    }
}

fn mylet_container(mysql: &Mysql) -> Container {
    let env = vec![
        EnvVar {
            name: "MYCTL_ADDR".to_string(),
            value: Some(mysql.spec.myctl_addr.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "GROUP_TOKEN".to_string(),
            value: Some(group_token(mysql)),
            ..Default::default()
        },
        EnvVar {
            name: "POD_NAME".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.name".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        EnvVar {
            name: "HTTP_ADDR".to_string(),
            value: Some(format!("0.0.0.0:{}", mysql.spec.mylet_port)),
            ..Default::default()
        },
        EnvVar {
            name: "MYSQL_RESTART_LIMIT".to_string(),
            value: Some(mysql.spec.switch_policy.restart_limit.to_string()),
            ..Default::default()
        },
    ];

    Container {
        name: "mylet".to_string(),
        image: Some(mysql.spec.image.clone()),
        image_pull_policy: Some(mysql.spec.image_pull_policy.clone()),
        env: Some(env),
        ports: Some(vec![
            ContainerPort {
                name: Some("mysql".to_string()),
                container_port: mysql.spec.port as i32,
                ..Default::default()
            },
            ContainerPort {
                name: Some("mylet".to_string()),
                container_port: mysql.spec.mylet_port as i32,
                ..Default::default()
            },
        ]),
        startup_probe: Some(mylet_probe(mysql, "startup")),
        liveness_probe: Some(mylet_probe(mysql, "liveness")),
        readiness_probe: Some(mylet_probe(mysql, "readiness")),
        volume_mounts: Some(vec![mydir_mount(mysql)]),
        ..Default::default()
    }
}

fn exporter_container(mysql: &Mysql) -> Container {
    Container {
        name: "exporter".to_string(),
        image: Some(mysql.spec.exporter_image.clone()),
        image_pull_policy: Some(mysql.spec.image_pull_policy.clone()),
        args: Some(mysql.spec.exporter_flags.clone()),
        env: Some(vec![EnvVar {
            name: "DATA_SOURCE_NAME".to_string(),
            value: Some(format!(
                "{}:{}@(localhost:{})/",
                mysql.spec.exporter_username, mysql.spec.exporter_password, mysql.spec.port
            )),
            ..Default::default()
        }]),
        ports: Some(vec![ContainerPort {
            name: Some("metrics".to_string()),
            container_port: mysql.spec.exporter_port as i32,
            ..Default::default()
        }]),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use myops_types::MysqlSpec;

    use super::*;

    fn sample() -> Mysql {
        let mut mysql = Mysql::new(
            "demo",
            MysqlSpec {
                replicas: Some(2),
                local_password: "lp".into(),
                replica_password: "rp".into(),
                image: "mysql:5.7".into(),
                myctl_addr: "myctl:33081".into(),
                ..Default::default()
            },
        );
        mysql.metadata.namespace = Some("default".into());
        mysql.default_fill().expect("default_fill");
        let status = mysql.status.as_mut().expect("status");
        status.write_id = Some(1);
        status.read_id = Some(2);
        mysql
    }

    #[test]
    fn write_service_pins_the_write_pod() {
        let services = services(&sample());
        assert_eq!(services.len(), 3);

        let write = &services[1];
        assert_eq!(write.metadata.name.as_deref(), Some("demo-write"));
        let selector = write
            .spec
            .as_ref()
            .and_then(|s| s.selector.as_ref())
            .expect("selector");
        assert_eq!(selector.get(POD_NAME_LABEL).map(String::as_str), Some("demo-1"));

        let read = &services[2];
        let selector = read
            .spec
            .as_ref()
            .and_then(|s| s.selector.as_ref())
            .expect("selector");
        assert_eq!(selector.get(POD_NAME_LABEL).map(String::as_str), Some("demo-2"));
    }

    #[test]
    fn headless_service_includes_unready_pods() {
        let services = services(&sample());
        let headless = &services[0];
        assert_eq!(headless.metadata.name.as_deref(), Some("demo-x"));
        let spec = headless.spec.as_ref().expect("spec");
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.publish_not_ready_addresses, Some(true));
    }

    #[test]
    fn statefulset_covers_the_whole_group() {
        let sts = statefulset(&sample());
        let spec = sts.spec.as_ref().expect("spec");
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.service_name.as_deref(), Some("demo-x"));

        let pod = spec.template.spec.as_ref().expect("pod");
        assert_eq!(pod.containers.len(), 1);
        let env = pod.containers[0].env.as_ref().expect("env");
        assert!(env.iter().any(|e| e.name == "GROUP_TOKEN"));
        assert!(env.iter().any(|e| e.name == "MYCTL_ADDR"));

        let startup = pod.containers[0].startup_probe.as_ref().expect("probe");
        assert_eq!(startup.failure_threshold, Some(720));
    }

    #[test]
    fn exporter_sidecar_appears_when_enabled() {
        let mut mysql = sample();
        mysql.spec.enable_exporter = true;
        mysql.spec.exporter_image = "mysqld-exporter".into();
        mysql.spec.exporter_password = "ep".into();

        let sts = statefulset(&mysql);
        let pod = sts
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .expect("pod");
        assert_eq!(pod.containers.len(), 2);
        assert_eq!(pod.containers[1].name, "exporter");
    }
}
