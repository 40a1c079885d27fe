mod checkpoint_test;
