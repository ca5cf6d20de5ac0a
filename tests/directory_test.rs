mod common;

use std::sync::Arc;

use common::{profile, user_row, MemoryBackend};
use serde_json::json;
use uuid::Uuid;

use school_admin::events::EventBus;
use school_admin::gateway::ApiGateway;
use school_admin::model::Role;
use school_admin::services::classes::{self, NewClass};
use school_admin::services::schools::{self, NewSchool, SchoolPatch};
use school_admin::services::users::{self, UserFilter, UserPatch};
use school_admin::services::{notifications, ServiceError};

fn setup() -> (MemoryBackend, ApiGateway) {
    let backend = MemoryBackend::new();
    let gw = ApiGateway::new(Arc::new(backend.clone()), EventBus::new());
    (backend, gw)
}

fn named(role: Role, school: Uuid, name: &str) -> school_admin::model::UserProfile {
    let mut p = profile(role, Some(school));
    p.full_name = name.to_string();
    p
}

#[tokio::test]
async fn users_are_scoped_to_the_callers_school() {
    let (backend, gw) = setup();
    let mine = Uuid::new_v4();
    let other = Uuid::new_v4();
    backend.seed(
        "users",
        vec![
            user_row(&named(Role::Teacher, mine, "Moussa Fall")),
            user_row(&named(Role::Student, mine, "Aminata Diallo")),
            user_row(&named(Role::Teacher, other, "Khady Ndiaye")),
        ],
    );

    let principal = profile(Role::Principal, Some(mine));
    let all = users::list(&gw, &principal, &UserFilter::default()).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].full_name, "Aminata Diallo");

    let teachers = UserFilter {
        role: Some(Role::Teacher),
        ..Default::default()
    };
    let found = users::list(&gw, &principal, &teachers).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].full_name, "Moussa Fall");

    let search = UserFilter {
        search: Some("dial".into()),
        ..Default::default()
    };
    let found = users::list(&gw, &principal, &search).await.unwrap();
    assert_eq!(found.len(), 1);

    let admin = profile(Role::Admin, None);
    assert_eq!(users::list(&gw, &admin, &UserFilter::default()).await.unwrap().len(), 3);

    let student = profile(Role::Student, Some(mine));
    assert!(matches!(
        users::list(&gw, &student, &UserFilter::default()).await,
        Err(ServiceError::Forbidden(_))
    ));
}

#[tokio::test]
async fn deactivating_users_respects_hierarchy() {
    let (backend, gw) = setup();
    let school = Uuid::new_v4();
    let secretary = profile(Role::Secretary, Some(school));
    let teacher = profile(Role::Teacher, Some(school));
    let student = profile(Role::Student, Some(school));
    backend.seed("users", vec![user_row(&secretary), user_row(&teacher), user_row(&student)]);

    let updated = users::set_active(&gw, &secretary, student.id, false).await.unwrap();
    assert!(!updated.is_active);
    assert!(matches!(
        users::set_active(&gw, &secretary, teacher.id, false).await,
        Err(ServiceError::Forbidden(_))
    ));
    assert!(matches!(
        users::set_active(&gw, &secretary, secretary.id, false).await,
        Err(ServiceError::Invalid(_))
    ));
}

#[tokio::test]
async fn only_admins_create_schools() {
    let (backend, gw) = setup();
    let school = Uuid::new_v4();
    let principal = profile(Role::Principal, Some(school));
    let new = NewSchool {
        name: "École Liberté 6".into(),
        address: Some("Dakar".into()),
        phone: None,
        email: None,
    };
    assert!(matches!(
        schools::create(&gw, &principal, &new).await,
        Err(ServiceError::Forbidden(_))
    ));
    assert_eq!(backend.count("insert", "schools"), 0);

    let admin = profile(Role::Admin, None);
    let created = schools::create(&gw, &admin, &new).await.unwrap();
    assert!(created.is_active);
    assert_eq!(created.name, "École Liberté 6");

    let patch = SchoolPatch {
        principal_id: Some(principal.id),
        ..Default::default()
    };
    let own_school = profile(Role::Principal, Some(created.id));
    assert!(matches!(
        schools::update(&gw, &own_school, created.id, &patch).await,
        Err(ServiceError::Forbidden(_))
    ));
    let updated = schools::update(&gw, &admin, created.id, &patch).await.unwrap();
    assert_eq!(updated.principal_id, Some(principal.id));
}

#[tokio::test]
async fn teacher_assignment_checks_school_and_role() {
    let (backend, gw) = setup();
    let school = Uuid::new_v4();
    let principal = profile(Role::Principal, Some(school));
    let local_teacher = profile(Role::Teacher, Some(school));
    let remote_teacher = profile(Role::Teacher, Some(Uuid::new_v4()));
    let secretary = profile(Role::Secretary, Some(school));
    backend.seed(
        "users",
        vec![user_row(&local_teacher), user_row(&remote_teacher), user_row(&secretary)],
    );

    let class = classes::create(
        &gw,
        &principal,
        &NewClass {
            school_id: school,
            name: "CM2 A".into(),
            level: Some("CM2".into()),
            teacher_id: None,
            capacity: Some(35),
        },
    )
    .await
    .unwrap();

    let err = classes::assign_teacher(&gw, &principal, class.id, Some(remote_teacher.id))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Invalid(_)));
    let err = classes::assign_teacher(&gw, &principal, class.id, Some(secretary.id))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Invalid(_)));

    let assigned = classes::assign_teacher(&gw, &principal, class.id, Some(local_teacher.id))
        .await
        .unwrap();
    assert_eq!(assigned.teacher_id, Some(local_teacher.id));

    let listed = classes::list(&gw, &local_teacher).await.unwrap();
    assert_eq!(listed.len(), 1);

    let bad = NewClass {
        school_id: school,
        name: "CE1".into(),
        level: None,
        teacher_id: None,
        capacity: Some(0),
    };
    assert!(matches!(
        classes::create(&gw, &principal, &bad).await,
        Err(ServiceError::Invalid(_))
    ));
}

#[tokio::test]
async fn notifications_belong_to_their_owner() {
    let (backend, gw) = setup();
    let school = Uuid::new_v4();
    let teacher = profile(Role::Teacher, Some(school));
    let other = profile(Role::Teacher, Some(school));
    backend.seed(
        "notifications",
        vec![
            json!({"id": Uuid::new_v4(), "user_id": teacher.id, "title": "a", "message": "m",
                   "is_read": false, "created_at": "2024-09-02T10:00:00Z"}),
            json!({"id": Uuid::new_v4(), "user_id": teacher.id, "title": "b", "message": "m",
                   "is_read": true, "created_at": "2024-09-03T10:00:00Z"}),
            json!({"id": Uuid::new_v4(), "user_id": other.id, "title": "c", "message": "m",
                   "is_read": false, "created_at": "2024-09-04T10:00:00Z"}),
        ],
    );

    let listed = notifications::list(&gw, &teacher, teacher.id, 10).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].title, "b");
    assert_eq!(notifications::unread_count(&gw, &teacher, teacher.id).await.unwrap(), 1);

    assert!(matches!(
        notifications::list(&gw, &teacher, other.id, 10).await,
        Err(ServiceError::Forbidden(_))
    ));

    assert_eq!(notifications::mark_all_read(&gw, &teacher).await.unwrap(), 1);
    assert_eq!(notifications::unread_count(&gw, &teacher, teacher.id).await.unwrap(), 0);
    assert_eq!(notifications::unread_count(&gw, &other, other.id).await.unwrap(), 1);
}

#[tokio::test]
async fn notifications_stay_inside_the_school() {
    let (backend, gw) = setup();
    let mine = Uuid::new_v4();
    let principal = profile(Role::Principal, Some(mine));
    let local = profile(Role::Teacher, Some(mine));
    let remote = profile(Role::Teacher, Some(Uuid::new_v4()));
    backend.seed("users", vec![user_row(&local), user_row(&remote)]);

    let sent = notifications::create(&gw, &principal, local.id, "Réunion", "Lundi 8h", "info", None)
        .await
        .unwrap();
    assert_eq!(sent.user_id, local.id);

    let err = notifications::create(&gw, &principal, remote.id, "Réunion", "Lundi 8h", "info", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Forbidden(_)));
    assert_eq!(backend.rows("notifications").len(), 1);

    let admin = profile(Role::Admin, None);
    notifications::create(&gw, &admin, remote.id, "Mise à jour", "Nouvelle version", "info", None)
        .await
        .unwrap();
    assert_eq!(backend.rows("notifications").len(), 2);
}

#[tokio::test]
async fn self_edit_cannot_move_own_class() {
    let (backend, gw) = setup();
    let school = Uuid::new_v4();
    let homeroom = Uuid::new_v4();
    let mut teacher = named(Role::Teacher, school, "Moussa Fall");
    teacher.class_id = Some(homeroom);
    let principal = profile(Role::Principal, Some(school));
    backend.seed("users", vec![user_row(&teacher), user_row(&principal)]);

    let patch = UserPatch {
        full_name: Some("Moussa A. Fall".into()),
        class_id: Some(Uuid::new_v4()),
        ..Default::default()
    };
    let updated = users::update(&gw, &teacher, teacher.id, &patch).await.unwrap();
    assert_eq!(updated.full_name, "Moussa A. Fall");
    assert_eq!(updated.class_id, Some(homeroom));

    // A class-only self-edit writes nothing.
    let class_only = UserPatch {
        class_id: Some(Uuid::new_v4()),
        ..Default::default()
    };
    let unchanged = users::update(&gw, &teacher, teacher.id, &class_only).await.unwrap();
    assert_eq!(unchanged.class_id, Some(homeroom));
    assert_eq!(backend.count("update", "users"), 1);

    // The principal still assigns classes.
    let moved = Uuid::new_v4();
    let by_principal = UserPatch {
        class_id: Some(moved),
        ..Default::default()
    };
    let reassigned = users::update(&gw, &principal, teacher.id, &by_principal).await.unwrap();
    assert_eq!(reassigned.class_id, Some(moved));
}
