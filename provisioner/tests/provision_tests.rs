mod common;

use cml_provisioner::auth::token::Grant;
use cml_provisioner::auth::Permission;
use cml_provisioner::openstack::ServerStatus;
use cml_provisioner::provision::{ProvisionError, CLOUD_TAG, TEMPLATE_TAG};
use common::{caller, cloud, global, launchable, on_cloud, FakeOpenstack, Harness, CLOUD};
use cumulus_rs::api::WorkerLauncher;
use cumulus_rs::cloud::{Configuration, Template};
use cumulus_rs::label::LabelExpression;
use cumulus_rs::options::{LauncherFactory, SlaveOptions};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

fn template(name: &str, options: SlaveOptions) -> Template {
    Template::new(name, "linux amd64", options)
}

async fn simple() -> Harness {
    Harness::single(
        cloud(launchable(), vec![template("tmpl", SlaveOptions::default())]),
        FakeOpenstack::default(),
    )
    .await
}

#[tokio::test]
async fn provision_permission_allows_provisioning() {
    let harness = simple().await;
    let auth = caller(vec![on_cloud(Permission::Provision)]);

    let worker = harness
        .provisioner
        .provision(&auth, CLOUD, "tmpl")
        .await
        .unwrap();

    assert!(worker.name.starts_with("tmpl-"));
    assert_eq!(worker.name.len(), "tmpl-".len() + 8);
    assert_eq!(worker.cloud, CLOUD);
    assert_eq!(worker.template, "tmpl");
    assert_eq!(worker.labels, "linux amd64");
    assert_eq!(worker.launcher, WorkerLauncher::Jnlp);
    assert_eq!(worker.fs_root, "/jenkins");
    assert_eq!(worker.num_executors, NonZeroU32::MIN);
    assert_eq!(worker.retention_time, 30);
    assert_eq!(worker.address.as_deref(), Some("10.0.0.1"));

    let booted = harness.openstack.booted();
    assert_eq!(booted.len(), 1);
    assert_eq!(booted[0].name, worker.name);
    assert_eq!(booted[0].flavor_id, "m1.small");
    assert_eq!(booted[0].metadata.get(CLOUD_TAG).unwrap(), CLOUD);
    assert_eq!(booted[0].metadata.get(TEMPLATE_TAG).unwrap(), "tmpl");
    assert!(harness.openstack.destroyed().is_empty());
}

#[tokio::test]
async fn configure_permission_allows_provisioning() {
    let harness = simple().await;
    let auth = caller(vec![on_cloud(Permission::Configure)]);
    assert!(harness.provisioner.provision(&auth, CLOUD, "tmpl").await.is_ok());
}

#[tokio::test]
async fn read_permission_is_denied() {
    let harness = simple().await;
    let auth = caller(vec![global(Permission::Read)]);

    let err = harness
        .provisioner
        .provision(&auth, CLOUD, "tmpl")
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::Unauthorized(_)), "{err}");
    assert!(harness.openstack.booted().is_empty());
    // Denied before any session is built.
    assert_eq!(harness.factory.calls(), 0);
}

#[tokio::test]
async fn permission_on_another_cloud_is_denied() {
    let harness = simple().await;
    let auth = caller(vec![Grant {
        permission: Permission::Provision,
        cloud: Some("elsewhere".into()),
    }]);
    assert!(matches!(
        harness.provisioner.provision(&auth, CLOUD, "tmpl").await,
        Err(ProvisionError::Unauthorized(_))
    ));
}

#[tokio::test]
async fn unknown_names_are_not_found() {
    let harness = simple().await;
    let auth = caller(vec![global(Permission::Administer)]);

    assert!(matches!(
        harness.provisioner.provision(&auth, CLOUD, "missing").await,
        Err(ProvisionError::NoSuchTemplate { .. })
    ));
    assert!(matches!(
        harness.provisioner.provision(&auth, "missing", "tmpl").await,
        Err(ProvisionError::NoSuchCloud(_))
    ));
    assert!(harness.openstack.booted().is_empty());
}

#[tokio::test]
async fn cloud_instance_cap_stops_provisioning() {
    let options = launchable().to_builder().instance_cap(2).build();
    let harness = Harness::single(
        cloud(options, vec![template("tmpl", SlaveOptions::default())]),
        FakeOpenstack::default(),
    )
    .await;
    harness.openstack.add_running("old-1", CLOUD, "other");
    harness.openstack.add_running("old-2", CLOUD, "tmpl");
    // Servers of other clouds do not count.
    harness.openstack.add_running("foreign", "another-cloud", "tmpl");
    let auth = caller(vec![on_cloud(Permission::Provision)]);

    let err = harness
        .provisioner
        .provision(&auth, CLOUD, "tmpl")
        .await
        .unwrap_err();
    assert!(
        matches!(err, ProvisionError::CloudCapReached { cap: 2, .. }),
        "{err}"
    );
    assert!(err.to_string().contains("instance cap of 2"));
    assert!(harness.openstack.booted().is_empty());
}

#[tokio::test]
async fn template_instance_cap_counts_only_its_servers() {
    let harness = Harness::single(
        cloud(
            launchable(),
            vec![
                template("capped", SlaveOptions::builder().instance_cap(1).build()),
                template("free", SlaveOptions::default()),
            ],
        ),
        FakeOpenstack::default(),
    )
    .await;
    harness.openstack.add_running("old", CLOUD, "capped");
    let auth = caller(vec![on_cloud(Permission::Provision)]);

    assert!(matches!(
        harness.provisioner.provision(&auth, CLOUD, "capped").await,
        Err(ProvisionError::TemplateCapReached { cap: 1, .. })
    ));
    assert!(harness.provisioner.provision(&auth, CLOUD, "free").await.is_ok());
}

#[tokio::test]
async fn failed_server_is_deleted() {
    let harness = Harness::single(
        cloud(launchable(), vec![template("tmpl", SlaveOptions::default())]),
        FakeOpenstack::settling_to(ServerStatus::Error),
    )
    .await;
    let auth = caller(vec![on_cloud(Permission::Provision)]);

    let err = harness
        .provisioner
        .provision(&auth, CLOUD, "tmpl")
        .await
        .unwrap_err();
    match err {
        ProvisionError::ServerFailed { server_id, message } => {
            assert_eq!(server_id, "srv-1");
            assert_eq!(message, "No valid host was found");
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(harness.openstack.destroyed(), vec!["srv-1".to_string()]);
    assert!(harness.openstack.server_ids().is_empty());
}

#[tokio::test]
async fn slow_server_times_out_and_is_deleted() {
    let options = launchable().to_builder().start_timeout(50).build();
    let harness = Harness::single(
        cloud(options, vec![template("tmpl", SlaveOptions::default())]),
        FakeOpenstack::settling_to(ServerStatus::Build),
    )
    .await;
    let auth = caller(vec![on_cloud(Permission::Provision)]);

    let err = harness
        .provisioner
        .provision(&auth, CLOUD, "tmpl")
        .await
        .unwrap_err();
    assert!(
        matches!(err, ProvisionError::Timeout { timeout_ms: 50, .. }),
        "{err}"
    );
    assert_eq!(harness.openstack.destroyed(), vec!["srv-1".to_string()]);
}

#[tokio::test]
async fn abandoned_launch_deletes_its_server() {
    let harness = Harness::single(
        cloud(launchable(), vec![template("tmpl", SlaveOptions::default())]),
        FakeOpenstack::settling_to(ServerStatus::Build),
    )
    .await;
    let auth = caller(vec![on_cloud(Permission::Provision)]);

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        harness.provisioner.provision(&auth, CLOUD, "tmpl"),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(harness.openstack.booted().len(), 1);

    for _ in 0..100 {
        if !harness.openstack.destroyed().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(harness.openstack.destroyed(), vec!["srv-1".to_string()]);
    assert!(harness.openstack.server_ids().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_launches_respect_the_cloud_cap() {
    let options = launchable().to_builder().instance_cap(3).build();
    let harness = Harness::single(
        cloud(options, vec![template("tmpl", SlaveOptions::default())]),
        FakeOpenstack::default(),
    )
    .await;

    let tasks: Vec<_> = (0..6)
        .map(|_| {
            let provisioner = Arc::clone(&harness.provisioner);
            tokio::spawn(async move {
                let auth = caller(vec![on_cloud(Permission::Provision)]);
                provisioner.provision(&auth, CLOUD, "tmpl").await
            })
        })
        .collect();
    let mut launched = 0;
    let mut capped = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => launched += 1,
            Err(ProvisionError::CloudCapReached { cap: 3, .. }) => capped += 1,
            Err(other) => panic!("unexpected error {other}"),
        }
    }

    assert_eq!((launched, capped), (3, 3));
    assert_eq!(harness.openstack.booted().len(), 3);
    assert_eq!(harness.factory.calls(), 1);
}

#[tokio::test]
async fn label_demand_picks_a_matching_template() {
    let harness = Harness::single(
        cloud(
            launchable(),
            vec![
                Template::new("windows", "windows amd64", SlaveOptions::default()),
                Template::new("linux", "linux amd64", SlaveOptions::default()),
                Template::new("plain", "", SlaveOptions::default()),
            ],
        ),
        FakeOpenstack::default(),
    )
    .await;
    let auth = caller(vec![on_cloud(Permission::Provision)]);

    let linux: LabelExpression = "linux && !windows".parse().unwrap();
    let worker = harness
        .provisioner
        .provision_for_label(&auth, CLOUD, Some(&linux))
        .await
        .unwrap();
    assert_eq!(worker.template, "linux");

    let worker = harness
        .provisioner
        .provision_for_label(&auth, CLOUD, None)
        .await
        .unwrap();
    assert_eq!(worker.template, "plain");

    let arm: LabelExpression = "arm".parse().unwrap();
    assert!(matches!(
        harness
            .provisioner
            .provision_for_label(&auth, CLOUD, Some(&arm))
            .await,
        Err(ProvisionError::NoTemplateForLabel { .. })
    ));
    assert_eq!(harness.openstack.booted().len(), 2);
}

#[tokio::test]
async fn label_demand_skips_templates_at_their_cap() {
    let harness = Harness::single(
        cloud(
            launchable(),
            vec![
                template("first", SlaveOptions::builder().instance_cap(1).build()),
                template("second", SlaveOptions::builder().instance_cap(1).build()),
            ],
        ),
        FakeOpenstack::default(),
    )
    .await;
    harness.openstack.add_running("old", CLOUD, "first");
    let auth = caller(vec![on_cloud(Permission::Provision)]);
    let linux = LabelExpression::atom("linux");

    let worker = harness
        .provisioner
        .provision_for_label(&auth, CLOUD, Some(&linux))
        .await
        .unwrap();
    assert_eq!(worker.template, "second");

    let err = harness
        .provisioner
        .provision_for_label(&auth, CLOUD, Some(&linux))
        .await
        .unwrap_err();
    assert!(
        matches!(err, ProvisionError::TemplateCapReached { ref template, .. } if template == "second"),
        "{err}"
    );
}

#[tokio::test]
async fn label_demand_requires_provision_permission() {
    let harness = simple().await;
    let auth = caller(vec![global(Permission::Read)]);
    assert!(matches!(
        harness
            .provisioner
            .provision_for_label(&auth, CLOUD, Some(&LabelExpression::atom("linux")))
            .await,
        Err(ProvisionError::Unauthorized(_))
    ));
    assert_eq!(harness.factory.calls(), 0);
}

#[tokio::test]
async fn boot_failure_creates_nothing_to_clean_up() {
    let harness = Harness::single(
        cloud(launchable(), vec![template("tmpl", SlaveOptions::default())]),
        FakeOpenstack::failing_boot("Quota exceeded for instances"),
    )
    .await;
    let auth = caller(vec![on_cloud(Permission::Provision)]);

    let err = harness
        .provisioner
        .provision(&auth, CLOUD, "tmpl")
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::Launch(_)));
    assert!(err.to_string().contains("Quota exceeded"));
    assert!(harness.openstack.destroyed().is_empty());
}

#[tokio::test]
async fn floating_ip_becomes_the_address() {
    let options = launchable().to_builder().floating_ip_pool("public").build();
    let harness = Harness::single(
        cloud(options, vec![template("tmpl", SlaveOptions::default())]),
        FakeOpenstack::default(),
    )
    .await;
    let auth = caller(vec![on_cloud(Permission::Provision)]);

    let worker = harness
        .provisioner
        .provision(&auth, CLOUD, "tmpl")
        .await
        .unwrap();
    assert_eq!(worker.address.as_deref(), Some("172.24.4.101"));
}

#[tokio::test]
async fn floating_ip_failure_deletes_server() {
    let options = launchable().to_builder().floating_ip_pool("public").build();
    let harness = Harness::single(
        cloud(options, vec![template("tmpl", SlaveOptions::default())]),
        FakeOpenstack::failing_floating_ip("pool exhausted"),
    )
    .await;
    let auth = caller(vec![on_cloud(Permission::Provision)]);

    assert!(matches!(
        harness.provisioner.provision(&auth, CLOUD, "tmpl").await,
        Err(ProvisionError::Openstack(_))
    ));
    assert_eq!(harness.openstack.destroyed(), vec!["srv-1".to_string()]);
}

#[tokio::test]
async fn template_without_boot_source_is_invalid() {
    let harness = Harness::single(
        cloud(
            SlaveOptions::builder().hardware_id("m1.small").build(),
            vec![template("tmpl", SlaveOptions::default())],
        ),
        FakeOpenstack::default(),
    )
    .await;
    let auth = caller(vec![on_cloud(Permission::Provision)]);

    let err = harness
        .provisioner
        .provision(&auth, CLOUD, "tmpl")
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::Invalid { .. }));
    assert!(harness.openstack.booted().is_empty());
}

#[tokio::test]
async fn ssh_launcher_uses_credentials_record() {
    let harness = simple().await;
    let credentials_id = {
        use cml_provisioner::store::credentials::CredentialsStore;
        harness
            .credentials
            .add_ssh_private_key("ubuntu", "KEY")
            .await
            .unwrap()
    };
    let ssh = SlaveOptions::builder()
        .launcher_factory(LauncherFactory::Ssh {
            credentials_id: credentials_id.clone(),
        })
        .build();
    let configuration =
        Configuration::new(vec![cloud(launchable(), vec![template("ssh", ssh)])]).unwrap();
    harness
        .provisioner
        .store()
        .save(configuration)
        .await
        .unwrap();
    let auth = caller(vec![on_cloud(Permission::Provision)]);

    let worker = harness
        .provisioner
        .provision(&auth, CLOUD, "ssh")
        .await
        .unwrap();
    assert_eq!(
        worker.launcher,
        WorkerLauncher::Ssh {
            credentials_id,
            username: "ubuntu".into(),
            host: Some("10.0.0.1".into()),
        }
    );
}

#[tokio::test]
async fn ssh_launcher_without_credentials_fails_before_boot() {
    let ssh = SlaveOptions::builder()
        .launcher_factory(LauncherFactory::Ssh {
            credentials_id: "gone".into(),
        })
        .build();
    let harness = Harness::single(
        cloud(launchable(), vec![template("ssh", ssh)]),
        FakeOpenstack::default(),
    )
    .await;
    let auth = caller(vec![on_cloud(Permission::Provision)]);

    let err = harness
        .provisioner
        .provision(&auth, CLOUD, "ssh")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no credentials record 'gone'"), "{err}");
    assert!(harness.openstack.booted().is_empty());
}

#[tokio::test]
async fn user_data_is_resolved_from_the_store() {
    let options = SlaveOptions::builder()
        .user_data_id("cloud-init")
        .security_groups("default, ssh")
        .build();
    let harness = Harness::single(
        cloud(
            launchable(),
            vec![
                template("with", options),
                template(
                    "dangling",
                    SlaveOptions::builder().user_data_id("missing").build(),
                ),
            ],
        ),
        FakeOpenstack::default(),
    )
    .await;
    {
        use cml_provisioner::store::user_data::UserDataStore;
        harness
            .user_data
            .put("cloud-init", "#cloud-config\r\n")
            .await
            .unwrap();
    }
    let auth = caller(vec![on_cloud(Permission::Provision)]);

    harness
        .provisioner
        .provision(&auth, CLOUD, "with")
        .await
        .unwrap();
    harness
        .provisioner
        .provision(&auth, CLOUD, "dangling")
        .await
        .unwrap();

    let booted = harness.openstack.booted();
    assert_eq!(booted[0].user_data.as_deref(), Some("#cloud-config\n"));
    assert_eq!(booted[0].security_groups, vec!["default", "ssh"]);
    assert_eq!(booted[1].user_data, None);
}

#[tokio::test]
async fn workers_are_listed_and_terminated() {
    let harness = simple().await;
    harness.openstack.add_running("foreign", "another-cloud", "tmpl");
    let auth = caller(vec![on_cloud(Permission::Provision), global(Permission::Read)]);

    let worker = harness
        .provisioner
        .provision(&auth, CLOUD, "tmpl")
        .await
        .unwrap();
    let listed = harness.provisioner.workers(&auth, CLOUD).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].server_id, worker.server_id);
    assert_eq!(listed[0].status, "ACTIVE");
    assert_eq!(listed[0].template.as_deref(), Some("tmpl"));

    assert!(matches!(
        harness
            .provisioner
            .terminate(&auth, CLOUD, "foreign")
            .await,
        Err(ProvisionError::NoSuchWorker { .. })
    ));
    assert!(matches!(
        harness.provisioner.terminate(&auth, CLOUD, "nope").await,
        Err(ProvisionError::NoSuchWorker { .. })
    ));
    harness
        .provisioner
        .terminate(&auth, CLOUD, &worker.server_id)
        .await
        .unwrap();
    assert!(harness
        .provisioner
        .workers(&auth, CLOUD)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn listing_workers_requires_read() {
    let harness = simple().await;
    let auth = caller(vec![]);
    assert!(matches!(
        harness.provisioner.workers(&auth, CLOUD).await,
        Err(ProvisionError::Unauthorized(_))
    ));
}

#[tokio::test]
async fn invalidating_clients_requires_administer() {
    let harness = simple().await;
    let provisioner = caller(vec![on_cloud(Permission::Provision)]);
    let admin = caller(vec![global(Permission::Administer)]);

    harness
        .provisioner
        .provision(&provisioner, CLOUD, "tmpl")
        .await
        .unwrap();
    assert_eq!(harness.factory.calls(), 1);

    assert!(harness.provisioner.invalidate_clients(&provisioner).is_err());
    harness.provisioner.invalidate_clients(&admin).unwrap();
    assert!(harness.provisioner.clients().is_empty());

    harness
        .provisioner
        .provision(&provisioner, CLOUD, "tmpl")
        .await
        .unwrap();
    assert_eq!(harness.factory.calls(), 2);
}

#[tokio::test]
async fn list_clouds_reports_effective_options() {
    let harness = simple().await;
    let auth = caller(vec![global(Permission::Read)]);

    let clouds = harness.provisioner.list_clouds(&auth).await.unwrap();
    assert_eq!(clouds.len(), 1);
    assert_eq!(clouds[0].effective_options.instance_cap, Some(10));
    assert_eq!(
        clouds[0].templates[0].effective_options.hardware_id.as_deref(),
        Some("m1.small")
    );

    assert!(harness
        .provisioner
        .list_clouds(&caller(vec![on_cloud(Permission::Provision)]))
        .await
        .is_err());
}
