//! Slicing whole plates through the plate list.

use slicekit_config::{DynamicConfig, PrinterProfile};
use slicekit_math::{Point3, Vec3};
use slicekit_model::{Model, ModelInstance, ModelObject, ModelVolume, TriangleMesh};
use slicekit_plate::{PartPlateList, PlateError};
use slicekit_print::step::PipelineStep;
use slicekit_print::{PrintObjectStep, PrintStep, ToolpathDumpExporter};

fn cube(model: &mut Model, name: &str, at: Vec3) -> usize {
    let mut object = ModelObject::new(name);
    object.add_volume(ModelVolume::new(
        "part",
        TriangleMesh::cuboid(Point3::origin(), [10.0, 10.0, 4.0]),
    ));
    object.add_instance(ModelInstance::new(at));
    model.add_object(object)
}

#[test]
fn test_single_plate_end_to_end() {
    let mut model = Model::new();
    cube(&mut model, "cube", Vec3::new(1000.0, 1000.0, 0.0));
    let mut plates = PartPlateList::from_profile(&PrinterProfile::generic());
    plates.reload_all_objects(&model, false).unwrap();
    assert!(plates.unprintable_plate().contain_instance((0, 0)));
    plates.add_to_plate(&mut model, (0, 0), 0).unwrap();

    let plate = plates.plate(0).unwrap();
    assert!(plate.contain_instance_totally((0, 0)));
    assert!(plate.is_ready_for_slice());
    assert!(plates.unprintable_plate().empty());

    let report = plates.slice_all(&model, &DynamicConfig::defaults());
    assert!(report.is_success(), "{:?}", report.plate_errors);
    assert_eq!(report.sliced, vec![0]);
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);

    let print = plates.get_print(0).unwrap();
    for &step in PrintObjectStep::ALL {
        assert!(print.is_object_step_done(step), "{step:?}");
    }
    assert!(print.is_step_done(PrintStep::SkirtBrim));
    assert!(!print.is_step_done(PrintStep::GCodeExport));
    assert!(plates.plate(0).unwrap().is_slice_result_valid());
    assert_eq!(plates.plate(0).unwrap().get_used_filaments(), &[1]);
    assert!(plates.is_all_slice_results_ready_for_print(&model));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plate_1.json");
    let result = plates.export_plate_gcode(0, &path, &ToolpathDumpExporter).unwrap();
    assert!(path.exists());
    assert_eq!(plates.slice_result(0), Some(&result));
    assert!(plates.is_all_slice_result_ready_for_export(&model));
}

#[test]
fn test_failed_plate_leaves_siblings_alone() {
    let mut model = Model::new();
    cube(&mut model, "good", Vec3::new(50.0, 50.0, 0.0));
    let mut plates = PartPlateList::new(200.0, 200.0, 250.0);
    plates.create_plate(&mut model, false).unwrap();
    // Hangs over the right edge of plate 1.
    cube(&mut model, "overhanging", Vec3::new(435.0, 50.0, 0.0));
    plates.reload_all_objects(&model, false).unwrap();
    assert_eq!(plates.find_instance((1, 0)), Some(1));

    let report = plates.slice_all(&model, &DynamicConfig::defaults());
    assert_eq!(report.sliced, vec![0]);
    assert!(matches!(report.plate_errors.get(&1), Some(PlateError::NotReady(1))));
    assert!(report.object_errors.is_empty());
    assert!(plates.plate(0).unwrap().is_slice_result_valid());
    assert!(!plates.plate(1).unwrap().is_slice_result_valid());
    assert!(!plates.is_all_slice_results_ready_for_print(&model));
}

#[test]
fn test_moving_an_instance_invalidates_its_plate() {
    let mut model = Model::new();
    cube(&mut model, "a", Vec3::new(50.0, 50.0, 0.0));
    cube(&mut model, "b", Vec3::new(100.0, 50.0, 0.0));
    let mut plates = PartPlateList::new(200.0, 200.0, 250.0);
    plates.reload_all_objects(&model, false).unwrap();
    let global = DynamicConfig::defaults();
    plates.slice_plate(&model, 0, &global).unwrap();
    assert!(plates.plate(0).unwrap().is_slice_result_valid());

    model.objects[1].instances[0].set_offset(Vec3::new(120.0, 60.0, 0.0));
    plates.notify_instance_update(&mut model, (1, 0), false).unwrap();
    assert!(!plates.plate(0).unwrap().is_slice_result_valid());

    plates.slice_plate(&model, 0, &global).unwrap();
    assert!(plates.plate(0).unwrap().is_slice_result_valid());
}
