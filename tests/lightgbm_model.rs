use forecast_engine::regressor::LightgbmBooster;

const TWO_TREE_MODEL: &str = r#"tree
version=v4
num_class=1
num_tree_per_iteration=1
label_index=0
max_feature_idx=2
objective=regression
feature_names=lag_1 lag_2 roll_mean_72
feature_infos=[0:400] [0:400] [0:300]
tree_sizes=412 298

Tree=0
num_leaves=3
num_cat=0
split_feature=0 1
split_gain=1520.5 310.25
threshold=4.5000000000000009 2.0000000000000004
decision_type=2 2
left_child=1 -2
right_child=-1 -3
leaf_value=10 1 2
leaf_weight=40 30 30
leaf_count=40 30 30
internal_value=0 0
internal_weight=0 0
internal_count=100 60
is_linear=0
shrinkage=1


Tree=1
num_leaves=1
num_cat=0
split_feature=
split_gain=
threshold=
decision_type=
left_child=
right_child=
leaf_value=0.5
leaf_weight=
leaf_count=
internal_value=
internal_weight=
internal_count=
is_linear=0
shrinkage=0.1


end of trees

feature_importances:
lag_1=1
lag_2=1

parameters:
[boosting: gbdt]
[objective: regression]
[learning_rate: 0.1]

end of parameters
"#;

#[test]
fn scores_sum_the_leaves_reached_in_every_tree() {
    let booster = LightgbmBooster::from_model_text(TWO_TREE_MODEL).expect("model parses");
    assert_eq!(booster.num_trees(), 2);
    assert_eq!(booster.num_features(), 3);

    assert_eq!(booster.predict(&[5.0, 0.0, 0.0]).unwrap(), 10.5);
    assert_eq!(booster.predict(&[1.0, 1.0, 0.0]).unwrap(), 1.5);
    assert_eq!(booster.predict(&[1.0, 3.0, 0.0]).unwrap(), 2.5);
}

#[test]
fn nan_is_treated_as_zero_without_a_missing_type() {
    let booster = LightgbmBooster::from_model_text(TWO_TREE_MODEL).expect("model parses");
    assert_eq!(booster.predict(&[f64::NAN, f64::NAN, 0.0]).unwrap(), 1.5);
}

#[test]
fn short_feature_rows_are_rejected() {
    let booster = LightgbmBooster::from_model_text(TWO_TREE_MODEL).expect("model parses");
    let err = booster.predict(&[1.0, 2.0]).unwrap_err();
    assert!(err.to_string().contains("expects 3 features, got 2"));
}

#[test]
fn zero_missing_type_routes_zero_to_the_default_side() {
    let model = |decision_type: u8| {
        format!(
            "tree\nobjective=regression\nmax_feature_idx=0\n\n\
             Tree=0\nnum_leaves=2\nnum_cat=0\nsplit_feature=0\nthreshold=-1\n\
             decision_type={decision_type}\nleft_child=-1\nright_child=-2\nleaf_value=3 7\n\n\
             end of trees\n"
        )
    };

    let default_left = LightgbmBooster::from_model_text(&model(6)).unwrap();
    assert_eq!(default_left.predict(&[0.0]).unwrap(), 3.0);
    assert_eq!(default_left.predict(&[5.0]).unwrap(), 7.0);

    let default_right = LightgbmBooster::from_model_text(&model(4)).unwrap();
    assert_eq!(default_right.predict(&[0.0]).unwrap(), 7.0);
    assert_eq!(default_right.predict(&[-5.0]).unwrap(), 3.0);
}

#[test]
fn malformed_models_fail_to_load() {
    assert!(LightgbmBooster::from_model_text("tree\nobjective=regression\n").is_err());

    let mismatched = "tree\nobjective=regression\nmax_feature_idx=0\n\n\
        Tree=0\nnum_leaves=3\nnum_cat=0\nsplit_feature=0\nthreshold=1\n\
        decision_type=2\nleft_child=-1\nright_child=-2\nleaf_value=1 2\n\n\
        end of trees\n";
    assert!(LightgbmBooster::from_model_text(mismatched).is_err());

    let categorical = "tree\nobjective=regression\nmax_feature_idx=0\n\n\
        Tree=0\nnum_leaves=2\nnum_cat=1\nsplit_feature=0\nthreshold=0\n\
        decision_type=1\nleft_child=-1\nright_child=-2\nleaf_value=1 2\n\n\
        end of trees\n";
    let err = LightgbmBooster::from_model_text(categorical).unwrap_err();
    assert!(err.to_string().contains("categorical"));
}
