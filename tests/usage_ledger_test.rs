#[cfg(test)]
mod usage_ledger_integration_tests {
    use diesel::prelude::*;
    use diesel::r2d2::{ConnectionManager, Pool};
    use flowserver::billing::usage::{check_usage_limit, month_to_date, track_usage};
    use flowserver::core::errors::ApiError;
    use flowserver::core::models::{NewOrganization, NewUsageEvent};
    use flowserver::core::schema::organizations;
    use flowserver::core::state::{run_migrations, DbPool};
    use uuid::Uuid;

    fn test_pool() -> Option<DbPool> {
        let url = match std::env::var("DATABASE_URL") {
            Ok(url) => url,
            Err(_) => {
                println!("Skipping test - DATABASE_URL not set");
                return None;
            }
        };
        let manager = ConnectionManager::new(&url);
        let pool = match Pool::builder().max_size(2).build(manager) {
            Ok(pool) => pool,
            Err(_) => {
                println!("Skipping test - cannot connect to database");
                return None;
            }
        };
        if run_migrations(&pool).is_err() {
            println!("Skipping test - migrations failed");
            return None;
        }
        Some(pool)
    }

    fn usage_event(org_id: Uuid, credits_used: i32) -> NewUsageEvent {
        NewUsageEvent {
            organization_id: org_id,
            user_id: None,
            event_type: "api_call".to_string(),
            credits_used,
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn ledger_round_trip_and_limit_check() {
        let Some(pool) = test_pool() else {
            return;
        };
        let mut conn = pool.get().unwrap();

        let org_id = Uuid::new_v4();
        diesel::insert_into(organizations::table)
            .values(NewOrganization {
                id: org_id,
                name: "Ledger Test".to_string(),
                slug: format!("ledger-test-{org_id}"),
                plan: "free".to_string(),
                usage_limit: 1_000,
                metadata: serde_json::json!({}),
            })
            .execute(&mut conn)
            .unwrap();

        // Summing the period reproduces the inserted totals exactly.
        track_usage(&mut conn, usage_event(org_id, 500)).unwrap();
        track_usage(&mut conn, usage_event(org_id, 450)).unwrap();
        assert_eq!(month_to_date(&mut conn, org_id).unwrap(), 950);

        let check = check_usage_limit(&mut conn, org_id, 100).unwrap();
        assert!(!check.allowed);
        assert_eq!(check.remaining, 50);

        // The append is unconditional even near the limit.
        track_usage(&mut conn, usage_event(org_id, 40)).unwrap();
        assert_eq!(month_to_date(&mut conn, org_id).unwrap(), 990);

        let missing = check_usage_limit(&mut conn, Uuid::new_v4(), 1);
        assert!(matches!(missing, Err(ApiError::NotFound)));
    }
}
