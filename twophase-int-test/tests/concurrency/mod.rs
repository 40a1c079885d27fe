mod concurrent_prepare_test;
