use std::io::Write;

use selfcal_config::load_imu_csv;

fn write_csv(content: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(content.as_bytes()).unwrap();
    f.flush().unwrap();
    f
}

#[test]
fn loads_a_well_formed_log() {
    let f = write_csv(
        "time,gx,gy,gz,ax,ay,az\n\
         0.00,0.001,-0.002,0.0005,0.02,-0.01,9.79\n\
         0.01,0.002,-0.001,0.0004,0.01,-0.02,9.81\n",
    );
    let rows = load_imu_csv(f.path()).unwrap();
    assert_eq!(rows.len(), 2);
    assert!((rows[0].az - 9.79).abs() < 1e-12);
    assert!((rows[1].time - 0.01).abs() < 1e-12);
}

#[test]
fn rejects_wrong_headers() {
    let f = write_csv("t,wx,wy,wz,ax,ay,az\n0.0,0,0,0,0,0,9.8\n");
    let err = load_imu_csv(f.path()).unwrap_err();
    assert!(err.to_string().contains("headers"));
}

#[test]
fn rejects_non_monotonic_timestamps() {
    let f = write_csv(
        "time,gx,gy,gz,ax,ay,az\n\
         0.02,0,0,0,0,0,9.8\n\
         0.01,0,0,0,0,0,9.8\n",
    );
    let err = load_imu_csv(f.path()).unwrap_err();
    assert!(err.to_string().contains("strictly increasing"));
}

#[test]
fn rejects_malformed_rows() {
    let f = write_csv(
        "time,gx,gy,gz,ax,ay,az\n\
         0.01,0,0,not_a_number,0,0,9.8\n",
    );
    let err = load_imu_csv(f.path()).unwrap_err();
    assert!(err.to_string().contains("row 2"));
}

#[test]
fn empty_log_is_fine() {
    let f = write_csv("time,gx,gy,gz,ax,ay,az\n");
    assert!(load_imu_csv(f.path()).unwrap().is_empty());
}
