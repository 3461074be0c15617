use chrono::{NaiveDate, NaiveDateTime};
use meter_reconciliation::*;

const SITE: &str = "mall";

fn at(month: u32, day: u32, hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, month, day)
        .unwrap()
        .and_hms_opt(hour, 0, 0)
        .unwrap()
}

fn meter(id: &str, number: &str, meter_type: MeterType, tariff: Option<&str>) -> Meter {
    Meter {
        id: id.to_string(),
        site_id: SITE.to_string(),
        meter_number: number.to_string(),
        name: format!("Meter {}", number),
        meter_type,
        rating: None,
        tariff_structure_id: tariff.map(str::to_string),
    }
}

fn reading(meter_id: &str, timestamp: NaiveDateTime, kwh: f64, kva: Option<f64>) -> MeterReading {
    MeterReading {
        meter_id: meter_id.to_string(),
        timestamp,
        kwh,
        kva,
    }
}

fn bulk_tou_tariff() -> TariffStructure {
    let json = r#"{
        "id": "bulk-tou",
        "name": "Large Power User TOU",
        "supply_authority": "City Power",
        "uses_tou": true,
        "time_periods": [
            { "season": "high", "day_type": "weekday", "start_hour": 6, "end_hour": 22, "rate_per_kwh": 3.0, "label": "Peak" },
            { "season": "high", "day_type": "weekday", "start_hour": 22, "end_hour": 6, "rate_per_kwh": 1.0, "label": "Off-peak" },
            { "season": "low", "day_type": "weekday", "start_hour": 0, "end_hour": 24, "rate_per_kwh": 1.2 }
        ],
        "charges": [
            { "kind": "basic", "unit": "per_month", "amount": 100.0, "description": "Basic charge" },
            { "kind": "demand", "unit": "per_kva", "amount": 50.0 }
        ]
    }"#;
    serde_json::from_str(json).unwrap()
}

fn domestic_block_tariff() -> TariffStructure {
    TariffStructure {
        id: "dom-block".to_string(),
        name: "Domestic Block".to_string(),
        supply_authority: "City Power".to_string(),
        uses_tou: false,
        blocks: vec![
            TariffBlock {
                block_number: 1,
                kwh_from: 0.0,
                kwh_to: Some(100.0),
                rate_per_kwh: 1.5,
                season: None,
            },
            TariffBlock {
                block_number: 2,
                kwh_from: 100.0,
                kwh_to: None,
                rate_per_kwh: 2.5,
                season: None,
            },
        ],
        time_periods: vec![],
        charges: vec![],
    }
}

/// Grid supply feeding two tenants and a common area, with rooftop solar behind the grid meter.
fn mall_store() -> MemoryStore {
    let mut store = MemoryStore::new();
    store.insert_tariff(bulk_tou_tariff());
    store.insert_tariff(domestic_block_tariff());

    store.insert_meter(meter("grid", "GRID-01", MeterType::Bulk, Some("bulk-tou")));
    store.insert_meter(meter("pv", "PV-01", MeterType::Solar, None));
    store.insert_meter(meter("t1", "T-01", MeterType::Tenant, Some("dom-block")));
    store.insert_meter(meter("t2", "T-02", MeterType::Tenant, Some("dom-block")));
    store.insert_meter(meter("ca", "CA-01", MeterType::Other, None));

    for child in ["pv", "t1", "t2", "ca"] {
        store.insert_connection(SITE, MeterConnection::new(child, "grid"));
    }
    store.set_role(SITE, "ca", MeterRole::CommonArea);

    // 2024-07-10 is a Wednesday
    store.insert_readings(vec![
        reading("grid", at(7, 10, 8), 400.0, Some(40.0)),
        reading("grid", at(7, 10, 22), 300.0, Some(25.0)),
        reading("pv", at(7, 10, 12), 200.0, None),
        reading("t1", at(7, 10, 9), 500.0, None),
        reading("t2", at(7, 11, 9), 300.0, None),
        reading("ca", at(7, 12, 9), 100.0, None),
    ]);
    store
}

fn july() -> BillingPeriod {
    parse_period_string("2024-07").unwrap()
}

fn result<'r>(run: &'r ReconciliationRun, meter_id: &str) -> &'r ReconciliationMeterResult {
    run.results
        .iter()
        .find(|r| r.meter_id == meter_id)
        .unwrap_or_else(|| panic!("no result for {}", meter_id))
}

#[test]
fn test_site_reconciliation_with_solar() {
    let mut store = mall_store();
    let settings = CalculationSettings::default();

    let run = ReconciliationProcessor::run(&mut store, &settings, SITE, "July 2024", july()).unwrap();

    let grid = result(&run, "grid");
    assert_eq!(grid.role, MeterRole::GridSupply);
    assert_eq!(grid.direct_kwh, 700.0);
    // tenants + common area - solar
    assert_eq!(grid.hierarchical_kwh, 700.0);

    let expected_grid = 400.0 * 3.0 + 300.0 * 1.0 + 100.0 * 31.0 / (365.25 / 12.0) + 50.0 * 40.0;
    assert!((grid.total_cost - expected_grid).abs() < 0.01);
    assert_eq!(grid.demand_charges, 2000.0);
    assert_eq!(grid.max_kva, Some(40.0));

    let t1 = result(&run, "t1");
    assert_eq!(t1.total_cost, 100.0 * 1.5 + 400.0 * 2.5);
    assert_eq!(result(&run, "pv").role, MeterRole::SolarEnergy);
    assert!(result(&run, "ca").tariff_name.is_none());

    let summary = &run.summary;
    assert_eq!(summary.grid_supply_kwh, 700.0);
    assert_eq!(summary.solar_kwh, 200.0);
    assert_eq!(summary.total_supply_kwh, 900.0);
    assert_eq!(summary.tenant_kwh, 800.0);
    assert_eq!(summary.common_area_kwh, 100.0);
    assert_eq!(summary.discrepancy_kwh, 0.0);
    assert!((summary.recovery_rate.unwrap() - 800.0 / 900.0 * 100.0).abs() < 1e-9);
    assert_eq!(summary.tenant_revenue, 1150.0 + 650.0);
    assert_eq!(summary.meters_with_errors, 0);
    assert!(run.warnings.is_empty(), "unexpected warnings: {:?}", run.warnings);

    let stored = store.runs_for_site(SITE).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].name, "July 2024");
}

#[test]
fn test_verified_run_detects_unmetered_load() {
    let mut store = mall_store();
    store.insert_readings(vec![reading("grid", at(7, 15, 10), 300.0, None)]);
    let settings = CalculationSettings::default();

    let result = run_with_verification(&mut store, &settings, SITE, "July 2024", july());
    match result {
        Err(ReconciliationError::EnergyBalanceViolation {
            meter, difference, ..
        }) => {
            assert_eq!(meter, "grid");
            assert!((difference - 300.0).abs() < 1e-9);
        }
        other => panic!("expected energy balance violation, got {:?}", other),
    }
    assert!(store.runs_for_site(SITE).unwrap().is_empty());
}

#[test]
fn test_corrections_flow_into_hierarchy() {
    let mut store = mall_store();
    let settings = CalculationSettings::default();
    let corrections: DataQualityCorrections = serde_json::from_str(
        r#"{
            "corrections": [
                { "action": "scale_readings", "meter_id": "t2", "factor": 2.0 },
                { "action": "exclude_meter", "meter_id": "ca" }
            ]
        }"#,
    )
    .unwrap();

    let run = ReconciliationRunner::new(&mut store, &settings)
        .with_corrections(corrections)
        .run(SITE, "July corrected", july())
        .unwrap();

    let t2 = result(&run, "t2");
    assert_eq!(t2.direct_kwh, 600.0);
    assert_eq!(t2.corrections_kwh, 300.0);
    assert!(run.results.iter().all(|r| r.meter_id != "ca"));

    // 500 + 600 - 200
    assert_eq!(result(&run, "grid").hierarchical_kwh, 900.0);
    // grid recorded 700 against 900 downstream
    assert_eq!(run.warnings.len(), 1);
    assert!(run.warnings[0].contains("grid"));
}

#[test]
fn test_uncovered_time_of_use_is_reported_per_meter() {
    let mut store = mall_store();
    // 2024-07-13 is a Saturday; the tariff has no weekend periods
    store.insert_readings(vec![reading("grid", at(7, 13, 10), 10.0, None)]);
    let settings = CalculationSettings::default();

    let run = run_reconciliation(&mut store, &settings, SITE, "July", july()).unwrap();

    let grid = result(&run, "grid");
    assert!(grid.has_error);
    assert_eq!(grid.total_cost, 0.0);
    assert!(grid.error_message.as_deref().unwrap().contains("Large Power User TOU"));
    assert_eq!(run.summary.meters_with_errors, 1);
    assert!(run.warnings.iter().any(|w| w.starts_with("Meter GRID-01")));

    // the remaining meters are still costed
    assert_eq!(result(&run, "t1").total_cost, 1150.0);
}

#[test]
fn test_cancelled_run_is_not_saved() {
    let mut store = mall_store();
    let settings = CalculationSettings::default();
    let cancel = CancellationFlag::new();
    cancel.cancel();

    let result = ReconciliationRunner::new(&mut store, &settings)
        .with_cancellation(cancel.clone())
        .run(SITE, "July", july());

    assert!(matches!(
        result,
        Err(ReconciliationError::Cancelled {
            completed: 0,
            total: 5
        })
    ));
    assert!(store.runs_for_site(SITE).unwrap().is_empty());
}

fn t1_bill(document_id: &str, total_amount: f64) -> DocumentExtraction {
    DocumentExtraction {
        document_id: document_id.to_string(),
        site_id: SITE.to_string(),
        period_start: NaiveDate::from_ymd_opt(2024, 7, 1).unwrap(),
        period_end: NaiveDate::from_ymd_opt(2024, 7, 31).unwrap(),
        total_amount,
        line_items: vec![
            ExtractedLineItem {
                description: "Energy charge".to_string(),
                consumption: Some(500.0),
                rate: None,
                amount: total_amount,
                unit: Some("kWh".to_string()),
                supply_type: SupplyType::Normal,
                meter_number: Some("T-01".to_string()),
            },
            ExtractedLineItem {
                description: "Solar export credit".to_string(),
                consumption: Some(50.0),
                rate: None,
                amount: -10.0,
                unit: Some("kWh".to_string()),
                supply_type: SupplyType::Solar,
                meter_number: Some("T-01".to_string()),
            },
        ],
    }
}

#[test]
fn test_document_batch_upserts_and_settles() {
    let mut store = mall_store();
    let settings = CalculationSettings::default();
    let cancel = CancellationFlag::new();

    let jobs = vec![
        DocumentJob {
            extraction: t1_bill("bill-07", 1150.0),
            meter_id: "t1".to_string(),
            tariff_structure_id: None,
        },
        DocumentJob {
            extraction: t1_bill("bill-07", 1150.0),
            meter_id: "missing".to_string(),
            tariff_structure_id: None,
        },
        DocumentJob {
            extraction: t1_bill("bill-07", 1150.0),
            meter_id: "pv".to_string(),
            tariff_structure_id: None,
        },
    ];

    let outcome = calculate_documents(&mut store, &jobs, &settings, &cancel);
    assert!(!outcome.cancelled);
    assert_eq!(outcome.succeeded, 1);
    assert_eq!(outcome.failed, 2);
    assert!(outcome.failures.iter().any(|f| f.message.contains("no tariff structure")));

    let rows = store.calculations_for_document("bill-07").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].total_kwh, 500.0);
    assert_eq!(rows[0].variance_amount, 0.0);
    assert_eq!(
        VarianceBand::classify(rows[0].variance_percentage.unwrap()),
        VarianceBand::Match
    );

    // recalculating the same document replaces the stored row
    let recalculated = vec![DocumentJob {
        extraction: t1_bill("bill-07", 1300.0),
        meter_id: "t1".to_string(),
        tariff_structure_id: Some("dom-block".to_string()),
    }];
    let outcome = calculate_documents(&mut store, &recalculated, &settings, &cancel);
    assert_eq!(outcome.succeeded, 1);

    let rows = store.calculations_for_document("bill-07").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].variance_amount, -150.0);
    let pct = rows[0].variance_percentage.unwrap();
    assert!((pct - (-150.0 / 1300.0 * 100.0)).abs() < 1e-9);
    assert_eq!(VarianceBand::classify(pct), VarianceBand::Mismatch);
}

#[test]
fn test_assign_tariffs_reports_partial_failure() {
    let mut store = mall_store();
    let outcome = assign_tariffs(
        &mut store,
        &[
            TariffAssignment {
                meter_id: "ca".to_string(),
                tariff_structure_id: Some("dom-block".to_string()),
            },
            TariffAssignment {
                meter_id: "nope".to_string(),
                tariff_structure_id: Some("dom-block".to_string()),
            },
            TariffAssignment {
                meter_id: "t1".to_string(),
                tariff_structure_id: Some("retired".to_string()),
            },
        ],
    );

    assert_eq!(outcome.succeeded, 1);
    assert_eq!(outcome.failed, 2);
    assert_eq!(
        store.meter("ca").unwrap().tariff_structure_id.as_deref(),
        Some("dom-block")
    );
    assert_eq!(
        store.meter("t1").unwrap().tariff_structure_id.as_deref(),
        Some("dom-block")
    );
}

#[test]
fn test_csv_readings_feed_a_run() -> anyhow::Result<()> {
    let csv_data = "\
timestamp,kwh,kva
2024-01-05 10:00,120.5,
2024-01-20 10:00,79.5,12.0
";
    let readings = parse_readings_csv(csv_data.as_bytes(), "t1")?;
    assert_eq!(readings.len(), 2);
    assert_eq!(readings[1].kva, Some(12.0));

    let mut store = MemoryStore::new();
    store.insert_tariff(domestic_block_tariff());
    store.insert_meter(meter("t1", "T-01", MeterType::Tenant, Some("dom-block")));
    store.insert_readings(readings);

    let settings = CalculationSettings::default();
    let run = run_reconciliation(&mut store, &settings, SITE, "January", parse_period_string("2024-01")?)?;

    let t1 = result(&run, "t1");
    assert_eq!(t1.direct_kwh, 200.0);
    assert_eq!(t1.total_cost, 150.0 + 100.0 * 2.5);
    assert_eq!(run.summary.recovery_rate, None);
    Ok(())
}

#[test]
fn test_register_flags_meters_without_tariff() {
    let store = mall_store();
    let register = MeterRegister::from_meters(SITE, &store.meters_for_site(SITE).unwrap());

    let missing: Vec<&str> = register
        .without_tariff()
        .iter()
        .map(|e| e.meter_number.as_str())
        .collect();
    assert_eq!(missing, vec!["PV-01", "CA-01"]);
    assert!(register.to_markdown().contains("PV-01 (Meter PV-01) **[NO TARIFF]**"));
}

#[test]
fn test_history_seasons_and_discontinuities() {
    let settings = CalculationSettings::default();
    let summary = |month: u32, kwh: f64, previous: f64, current: f64| PeriodSummary {
        period: month_period(2024, month).unwrap(),
        kwh,
        cost: Some(kwh * 2.0),
        previous_reading: Some(previous),
        current_reading: Some(current),
    };

    let history = vec![
        summary(5, 400.0, 0.0, 400.0),
        summary(6, 600.0, 400.0, 1000.0),
        summary(7, 700.0, 1050.0, 1750.0),
        summary(8, 650.0, 1750.0, 2400.0),
        summary(9, 420.0, 2400.0, 2820.0),
    ];

    let segments = seasonal_segments(&history, &settings);
    let seasons: Vec<Season> = segments.iter().map(|s| s.season).collect();
    assert_eq!(seasons, vec![Season::Low, Season::High, Season::Low]);
    assert_eq!(segments[1].period_count, 3);
    assert!((segments[1].average_kwh - 650.0).abs() < 1e-9);

    let averages = seasonal_averages(&history, &settings);
    assert!((averages[&Season::Low].average_kwh - 410.0).abs() < 1e-9);

    let gaps = detect_discontinuities(&history, settings.discontinuity_tolerance_kwh);
    assert_eq!(gaps.len(), 1);
    assert_eq!(gaps[0].difference, 50.0);
}

#[test]
fn test_settings_from_json_tighten_bands() {
    let settings =
        CalculationSettings::from_json_str(r#"{ "match_threshold_pct": 2.0, "winter_months": [5, 6, 7] }"#)
            .unwrap();

    assert_eq!(VarianceBand::classify_with(4.0, &settings), VarianceBand::Partial);
    assert_eq!(VarianceBand::classify(4.0), VarianceBand::Match);
    assert_eq!(settings.partial_threshold_pct, 10.0);
    assert_eq!(
        Season::for_period(&month_period(2024, 5).unwrap(), &settings),
        Season::High
    );
}
